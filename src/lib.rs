//! Swarm Node Agent - 单节点生命周期代理
//!
//! 负责一台参与 Docker Swarm 集群的机器：引导身份与证书、对照
//! 安全级别决定的必须模块集调和运行中的服务、以版本化 config/secret
//! 轮换凭证，并驱动决定节点允许运行内容的 runlevel 状态机。

pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EnvConfig;
use crate::error::{AgentError, AgentResult};
use crate::infra::cluster::ClusterClient;
use crate::infra::docker_cli::DockerCliClient;
use crate::infra::issuer::HttpCertificateIssuer;
use crate::services::apps::ApplicationsHandler;
use crate::services::bus::{BusDispatcher, NullBusTransport};
use crate::services::certificates::CertificateLifecycle;
use crate::services::credentials::{CredentialRetention, CredentialStore};
use crate::services::install::InstallPipeline;
use crate::services::presence::presence_loop;
use crate::services::reconciler::ServiceReconciler;
use crate::services::runlevel::{apply_configuration, RunlevelController};
use crate::services::supervisor::TaskGroup;
use crate::services::watchdog::{restart_watchdog, ReconcileLoop};
use crate::state::AgentContext;

/// 命令行运行参数
#[derive(Debug, Default)]
pub struct RuntimeConfig {
    pub data_dir: Option<PathBuf>,
}

/// 组装完成的 agent
///
/// 总线传输层是外部协作者：嵌入方拿到 `dispatcher` 后把入站请求
/// 交给它处理。独立运行时使用空传输。
pub struct Agent {
    pub context: Arc<AgentContext>,
    pub dispatcher: Arc<BusDispatcher>,
    cluster: Arc<dyn ClusterClient>,
    cluster_available: bool,
    lifecycle: Arc<CertificateLifecycle>,
    reconcile_loop: Arc<ReconcileLoop>,
    controller: Arc<RunlevelController>,
}

/// 组装 agent 的全部组件
pub async fn build_agent(env_config: EnvConfig) -> AgentResult<Agent> {
    let context = Arc::new(AgentContext::new(env_config)?);

    let docker = DockerCliClient::new();
    let cluster_available = docker.available().await;
    let cluster: Arc<dyn ClusterClient> = Arc::new(docker);
    if cluster_available {
        if let Err(err) = cluster.ensure_swarm(&context.config.swarm_network).await {
            warn!(error = %err, "Swarm bootstrap failed, will retry on reconciliation");
        }
    } else {
        warn!("Orchestrator not available");
    }

    let store = Arc::new(CredentialStore::new(
        cluster.clone(),
        context.config.secrets_dir.clone(),
        CredentialRetention::Keep,
    ));
    let issuer = Arc::new(HttpCertificateIssuer::new(context.config.issuer_url.clone()));
    let lifecycle =
        Arc::new(CertificateLifecycle::new(context.clone(), issuer, store.clone()));

    let reconciler = Arc::new(ServiceReconciler::new(cluster.clone(), store.clone()));
    let pipeline =
        Arc::new(InstallPipeline::new(context.clone(), cluster.clone(), store.clone()));
    let apps = Arc::new(ApplicationsHandler::new(
        context.clone(),
        cluster.clone(),
        lifecycle.clone(),
        pipeline.clone(),
    ));
    let dispatcher = Arc::new(BusDispatcher::new(context.clone(), apps));

    let bus = Arc::new(NullBusTransport);
    let controller = Arc::new(RunlevelController::new(
        context.clone(),
        cluster.clone(),
        lifecycle.clone(),
        bus.clone(),
    ));
    let reconcile_loop = Arc::new(ReconcileLoop::new(
        context.clone(),
        reconciler,
        pipeline,
        store,
    ));

    // 配置 reload 后重新计算 runlevel 与必须模块集
    {
        let context_ref = context.clone();
        let lifecycle_ref = lifecycle.clone();
        context.add_reload_listener(Box::new(move |_identity| {
            if let Err(err) =
                apply_configuration(&context_ref, &lifecycle_ref, cluster_available)
            {
                error!(error = %err, "Failed to apply configuration");
            }
        }));
    }

    Ok(Agent {
        context,
        dispatcher,
        cluster,
        cluster_available,
        lifecycle,
        reconcile_loop,
        controller,
    })
}

impl Agent {
    /// 运行到停止信号或任务组失败为止
    pub async fn run(self) -> AgentResult<()> {
        // 初始配置加载；不支持的拓扑直接终止
        self.context.reload()?;
        match apply_configuration(&self.context, &self.lifecycle, self.cluster_available) {
            Ok(()) => {}
            Err(err @ AgentError::UnsupportedTopology(_)) => return Err(err),
            Err(err) => {
                // 配置错误：留在 Init，等待配置修复后 reload
                error!(error = %err, "Initial configuration failed, staying at runlevel init");
            }
        }

        let mut group = TaskGroup::new(self.context.stop_token());

        let signal_context = self.context.clone();
        group.spawn("signal-watcher", async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received");
            signal_context.stop();
            Ok(())
        });

        let controller = self.controller.clone();
        group.spawn("runlevel-controller", async move { controller.run().await });

        let reconcile = self.reconcile_loop.clone();
        group.spawn("reconcile-loop", async move { reconcile.run().await });

        group.spawn("restart-watchdog", restart_watchdog(self.context.clone()));

        let producer: Arc<NullBusTransport> = Arc::new(NullBusTransport);
        group.spawn("presence", presence_loop(self.context.clone(), producer));

        group.spawn(
            "certificate-maintenance",
            self.lifecycle.clone().maintenance_loop(),
        );

        let result = group.run().await;
        if let Err(err) = &result {
            // 结构化并发契约：任何子任务的未处理错误意味着进程
            // 不变量不再可信
            error!(error = %err, "Supervised task failed, terminating");
        }
        result
    }

    /// 集群能力（嵌入方使用）
    pub fn cluster(&self) -> Arc<dyn ClusterClient> {
        self.cluster.clone()
    }
}

/// 初始化日志并运行 agent，返回进程退出码
pub async fn init_and_run_agent(runtime: RuntimeConfig) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let env_config = match runtime.data_dir {
        Some(data_dir) => EnvConfig::with_data_dir(data_dir),
        None => EnvConfig::from_env(),
    };
    info!(
        version = config::env::constants::VERSION,
        data_dir = %env_config.data_dir.display(),
        "Starting swarm node agent"
    );

    let agent = match build_agent(env_config).await {
        Ok(agent) => agent,
        Err(err) => {
            error!(error = %err, "Failed to initialize agent");
            return 1;
        }
    };

    match agent.run().await {
        Ok(()) => {
            info!("Agent stopped");
            0
        }
        Err(_) => 1,
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(error = %err, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
