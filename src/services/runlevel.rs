//! Runlevel 控制器
//!
//! 顶层状态机。配置每次变化时重新计算适用的 runlevel 和必须模块
//! 集，并在专用任务里串行执行进入/退出动作（watch 通道合并转换
//! 期间到达的重复请求，转换完成后只重新评估一次）。
//!
//! 策略表取代了原实现里每个 runlevel×security 组合一个类型的
//! 继承结构：每个组合就是一条数据记录。

use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::catalog;
use crate::config::env::constants::SERVICE_WAIT_POLL_SECS;
use crate::config::modules::{self, module_service_name, MODULES_INSTALLATION};
use crate::domain::runlevel::{compute_runlevel, Runlevel};
use crate::domain::security::SecurityLevel;
use crate::error::{AgentError, AgentResult};
use crate::infra::cluster::{ClusterClient, ClusterError};
use crate::services::bus::BusRegistration;
use crate::services::certificates::CertificateLifecycle;
use crate::state::AgentContext;

/// 一个 (runlevel, security) 组合的策略记录
#[derive(Clone, Debug)]
pub struct RunlevelPolicy {
    /// 必须模块文件列表
    pub required_modules: &'static [&'static str],
    /// 进入后需要等待就绪的服务
    pub wait_for: Vec<&'static str>,
    /// 进入后是否注册到总线
    pub register_bus: bool,
    /// 进入前是否清理安装期残留服务
    pub cleanup_installation: bool,
    /// 进入时是否续期证书
    pub renew_certificates: bool,
}

/// 查询策略表
pub fn policy_for(runlevel: Runlevel, security: Option<SecurityLevel>) -> RunlevelPolicy {
    let required_modules = modules::required_modules(runlevel, security);
    match runlevel {
        Runlevel::Init => RunlevelPolicy {
            required_modules,
            wait_for: Vec::new(),
            register_bus: false,
            cleanup_installation: false,
            renew_certificates: false,
        },
        Runlevel::Installing => RunlevelPolicy {
            required_modules,
            wait_for: vec!["proxyinstall"],
            register_bus: false,
            cleanup_installation: false,
            renew_certificates: false,
        },
        Runlevel::CertificateExpired => RunlevelPolicy {
            required_modules,
            wait_for: Vec::new(),
            register_bus: false,
            cleanup_installation: false,
            renew_certificates: false,
        },
        Runlevel::Normal => {
            let mut wait_for = vec!["proxy"];
            if security.map(|s| s.is_protected()).unwrap_or(false) {
                // 后续服务的凭证交换假定 broker 和内部网关可达
                wait_for.push("broker");
                wait_for.push("gateway");
            }
            RunlevelPolicy {
                required_modules,
                wait_for,
                register_bus: true,
                cleanup_installation: true,
                renew_certificates: true,
            }
        }
    }
}

/// 重新计算 runlevel 和必须模块集
///
/// 初始加载和每次配置 reload 后调用。配置错误向上传播，调用方
/// 保持节点在上一个稳定 runlevel。
pub fn apply_configuration(
    context: &AgentContext,
    lifecycle: &CertificateLifecycle,
    cluster_available: bool,
) -> AgentResult<()> {
    let identity = context.identity();
    let expired = lifecycle.node_certificate_expired();
    let runlevel = compute_runlevel(identity.security, expired, cluster_available)?;

    let mut required: Vec<String> = modules::required_modules(runlevel, identity.security)
        .iter()
        .map(|m| m.to_string())
        .collect();

    // 管理员可以通过 disabled_modules.json 停用个别必须模块
    let disabled = load_disabled_modules(context);
    if !disabled.is_empty() {
        info!(disabled = ?disabled, "Disabling required modules");
        required.retain(|m| !disabled.contains(m));
    }

    info!(runlevel = %runlevel, modules = required.len(), "Applied node configuration");
    context.app_status.set_required_modules(required);
    context.set_runlevel(runlevel);
    Ok(())
}

fn load_disabled_modules(context: &AgentContext) -> Vec<String> {
    let path = context.config.config_dir.join("disabled_modules.json");
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => return Vec::new(),
    };
    #[derive(serde::Deserialize)]
    struct Disabled {
        disabled: Vec<String>,
    }
    match serde_json::from_str::<Disabled>(&content) {
        Ok(parsed) => parsed.disabled,
        Err(err) => {
            warn!(error = %err, "Invalid disabled_modules.json, ignoring");
            Vec::new()
        }
    }
}

/// Runlevel 控制器
pub struct RunlevelController {
    context: Arc<AgentContext>,
    cluster: Arc<dyn ClusterClient>,
    lifecycle: Arc<CertificateLifecycle>,
    bus: Arc<dyn BusRegistration>,
}

impl RunlevelController {
    pub fn new(
        context: Arc<AgentContext>,
        cluster: Arc<dyn ClusterClient>,
        lifecycle: Arc<CertificateLifecycle>,
        bus: Arc<dyn BusRegistration>,
    ) -> Self {
        Self { context, cluster, lifecycle, bus }
    }

    /// 转换驱动循环：串行执行转换，期间到达的变化合并到下一轮
    pub async fn run(&self) -> AgentResult<()> {
        let stop = self.context.stop_token();
        let mut rx = self.context.subscribe_runlevel();
        let mut previous = Runlevel::Init;

        loop {
            let level = *rx.borrow_and_update();
            if level != previous {
                info!(from = %previous, to = %level, "Changing runlevel");
                match self.transition(previous, level).await {
                    Ok(()) => previous = level,
                    Err(err) => {
                        // 失败时留在上一个稳定 runlevel，延迟后重试
                        error!(error = %err, "Runlevel transition failed, staying at {}", previous);
                        if !self.context.wait(Duration::from_secs(30)).await {
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// 执行一次转换（退出动作先于进入动作）
    pub(crate) async fn transition(&self, from: Runlevel, to: Runlevel) -> AgentResult<()> {
        if from == Runlevel::Normal {
            // 离开 Normal 必须先停掉总线注册
            self.bus.unregister().await?;
            info!("Stopped runlevel {}", from);
        }

        let security = self.context.identity().security;
        let policy = policy_for(to, security);

        if policy.cleanup_installation {
            self.cleanup_installation_services(&policy).await?;
        }

        if policy.renew_certificates {
            let required = self.context.app_status.required_modules();
            let module_files: Vec<&str> = required.iter().map(String::as_str).collect();
            let configs = catalog::load_required_modules(
                &self.context.config.catalog_dir,
                &module_files,
            );
            self.lifecycle.renew_due(&configs).await?;
        }

        // 触发调和并等待关键服务就绪
        self.context.trigger_reconcile();
        for service in &policy.wait_for {
            self.wait_for_service(service).await;
            if self.context.stopping() {
                return Ok(());
            }
        }

        if policy.register_bus {
            info!("Runlevel {} - register on bus", to);
            self.bus.register().await?;
        }

        match to {
            Runlevel::Installing => {
                let identity = self.context.identity();
                info!(
                    "Ready to install. Go to https://{} using a web browser to begin.",
                    identity.hostname
                );
            }
            Runlevel::CertificateExpired => {
                let identity = self.context.identity();
                info!(
                    "Ready for certificate recovery at https://{}.",
                    identity.hostname
                );
            }
            Runlevel::Normal => info!("Runlevel normal READY"),
            Runlevel::Init => {}
        }

        Ok(())
    }

    /// 移除只在安装模式需要的残留服务
    async fn cleanup_installation_services(&self, policy: &RunlevelPolicy) -> AgentResult<()> {
        for module_file in MODULES_INSTALLATION {
            if policy.required_modules.contains(module_file) {
                continue;
            }
            let service = module_service_name(module_file);
            match self.cluster.remove_service(service).await {
                Ok(()) => info!(service = %service, "Removed installation-only service"),
                Err(ClusterError::NotFound(_)) => {}
                Err(err) => return Err(AgentError::Cluster(err)),
            }
        }
        Ok(())
    }

    /// 阻塞到服务运行为止（已停用的服务视为就绪）
    async fn wait_for_service(&self, name: &str) {
        loop {
            if let Some(status) = self.context.app_status.get(name) {
                if status.running || status.disabled {
                    return;
                }
            }
            info!(service = %name, "Waiting for service");
            if !self.context.wait(Duration::from_secs(SERVICE_WAIT_POLL_SECS)).await {
                return; // 停止信号
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::domain::status::AppStatus;
    use crate::infra::cluster::testing::FakeClusterClient;
    use crate::services::bus::NullBusTransport;
    use crate::services::certificates::testing::FakeIssuer;
    use crate::services::credentials::{CredentialRetention, CredentialStore};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        context: Arc<AgentContext>,
        cluster: Arc<FakeClusterClient>,
        lifecycle: Arc<CertificateLifecycle>,
        controller: RunlevelController,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let config = EnvConfig::with_data_dir(PathBuf::from(dir.path()));
        let context = Arc::new(AgentContext::new(config.clone()).unwrap());
        let cluster = Arc::new(FakeClusterClient::new());
        let store = Arc::new(CredentialStore::new(
            cluster.clone(),
            config.secrets_dir.clone(),
            CredentialRetention::Keep,
        ));
        let lifecycle = Arc::new(CertificateLifecycle::new(
            context.clone(),
            Arc::new(FakeIssuer::new()),
            store,
        ));
        let controller = RunlevelController::new(
            context.clone(),
            cluster.clone(),
            lifecycle.clone(),
            Arc::new(NullBusTransport),
        );
        Harness { _dir: dir, context, cluster, lifecycle, controller }
    }

    #[test]
    fn test_policy_table() {
        let installing = policy_for(Runlevel::Installing, None);
        assert_eq!(installing.wait_for, vec!["proxyinstall"]);
        assert!(!installing.register_bus);

        let public = policy_for(Runlevel::Normal, Some(SecurityLevel::Public));
        assert_eq!(public.wait_for, vec!["proxy"]);
        assert!(public.register_bus);

        let protected = policy_for(Runlevel::Normal, Some(SecurityLevel::Protected));
        assert_eq!(protected.wait_for, vec!["proxy", "broker", "gateway"]);
        assert!(protected.cleanup_installation);
    }

    #[test]
    fn test_apply_configuration_installing_without_security() {
        let h = harness();
        apply_configuration(&h.context, &h.lifecycle, true).unwrap();
        assert_eq!(h.context.runlevel(), Runlevel::Installing);
        assert_eq!(
            h.context.app_status.required_modules(),
            vec!["docker.certissuer.json".to_string(), "docker.proxyinstall.json".to_string()]
        );
    }

    #[test]
    fn test_apply_configuration_expired_certificate() {
        let h = harness();
        fs::write(h.context.config.config_dir.join("node.security"), "protected").unwrap();
        h.context.reload().unwrap();

        // 没有节点证书 -> CertificateExpired
        apply_configuration(&h.context, &h.lifecycle, true).unwrap();
        assert_eq!(h.context.runlevel(), Runlevel::CertificateExpired);
    }

    #[tokio::test]
    async fn test_apply_configuration_normal_after_certificate() {
        let h = harness();
        fs::write(h.context.config.config_dir.join("node.security"), "private").unwrap();
        h.context.reload().unwrap();
        h.lifecycle.ensure_node_certificate().await.unwrap();

        apply_configuration(&h.context, &h.lifecycle, true).unwrap();
        assert_eq!(h.context.runlevel(), Runlevel::Normal);
    }

    #[test]
    fn test_apply_configuration_protected_without_cluster_fails() {
        let h = harness();
        fs::write(h.context.config.config_dir.join("node.security"), "protected").unwrap();
        h.context.reload().unwrap();

        let result = apply_configuration(&h.context, &h.lifecycle, false);
        assert!(matches!(result, Err(AgentError::UnsupportedTopology(_))));
        // 失败时留在原 runlevel
        assert_eq!(h.context.runlevel(), Runlevel::Init);
    }

    #[test]
    fn test_disabled_modules_filtered() {
        let h = harness();
        fs::write(
            h.context.config.config_dir.join("disabled_modules.json"),
            r#"{"disabled": ["docker.proxyinstall.json"]}"#,
        )
        .unwrap();
        apply_configuration(&h.context, &h.lifecycle, true).unwrap();
        assert_eq!(
            h.context.app_status.required_modules(),
            vec!["docker.certissuer.json".to_string()]
        );
    }

    #[tokio::test]
    async fn test_entering_normal_cleans_installation_leftovers() {
        let h = harness();
        fs::write(h.context.config.config_dir.join("node.security"), "public").unwrap();
        h.context.reload().unwrap();
        h.lifecycle.ensure_node_certificate().await.unwrap();
        apply_configuration(&h.context, &h.lifecycle, true).unwrap();

        // 安装模式留下的 proxyinstall 服务
        h.cluster.add_service(crate::infra::cluster::ClusterService {
            name: "proxyinstall".to_string(),
            ..Default::default()
        });
        // 让 wait_for_service 立即通过
        h.context.app_status.update(
            "proxy",
            AppStatus { installed: true, running: true, preparing: false, disabled: false },
        );

        h.controller
            .transition(Runlevel::Installing, Runlevel::Normal)
            .await
            .unwrap();

        let services = h.cluster.state.lock().unwrap().services.clone();
        assert!(services.iter().all(|s| s.name != "proxyinstall"));
    }

    #[tokio::test]
    async fn test_disabled_wait_target_does_not_block() {
        let h = harness();
        fs::write(h.context.config.config_dir.join("node.security"), "public").unwrap();
        h.context.reload().unwrap();
        h.lifecycle.ensure_node_certificate().await.unwrap();
        apply_configuration(&h.context, &h.lifecycle, true).unwrap();

        // proxy 被人工停用：等待立即结束而不是卡住
        h.context.app_status.update(
            "proxy",
            AppStatus { installed: true, running: false, preparing: false, disabled: true },
        );

        h.controller
            .transition(Runlevel::Installing, Runlevel::Normal)
            .await
            .unwrap();
    }
}
