//! 安装管道
//!
//! 下载、安装两级流水线，中间用有界队列连接：
//! - 下载级：检查镜像是否在本地，缺失则拉取；拉取失败跳过该动作，
//!   独立动作继续解析（已入队的安装照常完成）
//! - 安装级：严格按调和器产出的顺序消费，每个动作恰好执行
//!   创建 / 重启 / 只更新凭证引用 三者之一；单个动作失败记录
//!   日志并继续，下个完整调和周期重试
//!
//! 队列发送端关闭即为结束哨兵。两级在同一个监督范围内运行，
//! 任何一级出现非领域错误则整个周期中止，外层调和循环不受影响。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::env::constants::INSTALL_QUEUE_DEPTH;
use crate::domain::service::{ActionKind, PlannedAction, PasswordGenerator};
use crate::error::AgentError;
use crate::infra::cluster::{ClusterClient, ClusterError, ResolvedServiceSpec};
use crate::services::apps::install_web_archives;
use crate::services::credentials::CredentialStore;
use crate::state::AgentContext;

/// 解析完成、等待安装的动作
struct ResolvedAction {
    action: PlannedAction,
    /// 有容器部分的动作的镜像 tag
    image_tag: Option<String>,
}

/// 安装管道
pub struct InstallPipeline {
    context: Arc<AgentContext>,
    cluster: Arc<dyn ClusterClient>,
    store: Arc<CredentialStore>,
}

impl InstallPipeline {
    pub fn new(
        context: Arc<AgentContext>,
        cluster: Arc<dyn ClusterClient>,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self { context, cluster, store }
    }

    /// 执行一个计划
    ///
    /// 返回后计划里的每个动作要么完成、要么已记录失败；上个周期的
    /// 队列在此函数返回时必然已排空，不会有陈旧动作串入下个周期。
    pub async fn run_cycle(&self, plan: Vec<PlannedAction>) -> Result<(), AgentError> {
        if plan.is_empty() {
            return Ok(());
        }
        info!(actions = plan.len(), "Starting install cycle");

        let (tx, rx) = mpsc::channel::<ResolvedAction>(INSTALL_QUEUE_DEPTH);
        let resolve = self.resolve_stage(plan, tx);
        let install = self.install_stage(rx);
        tokio::try_join!(resolve, install)?;

        debug!("Install cycle done");
        Ok(())
    }

    /// 下载级：镜像解析
    async fn resolve_stage(
        &self,
        plan: Vec<PlannedAction>,
        tx: mpsc::Sender<ResolvedAction>,
    ) -> Result<(), AgentError> {
        for action in plan {
            let image_tag = match &action.status.configuration.image {
                Some(image) => {
                    match self.resolve_image(image).await {
                        Ok(tag) => Some(tag),
                        Err(err) => {
                            // 失败的动作跳过，独立动作继续解析
                            warn!(
                                service = %action.service_name(),
                                image = %image,
                                error = %err,
                                "Image unavailable, skipping action this cycle"
                            );
                            continue;
                        }
                    }
                }
                None => None, // 纯 web 应用
            };

            if tx.send(ResolvedAction { action, image_tag }).await.is_err() {
                // 安装级已退出（周期中止）
                return Ok(());
            }
        }
        // tx 在此 drop：结束哨兵
        Ok(())
    }

    async fn resolve_image(&self, image: &str) -> Result<String, ClusterError> {
        if self.cluster.image_present(image).await? {
            return Ok(image.to_string());
        }
        info!(image = %image, "Image missing locally, downloading");
        self.cluster.pull_image(image).await
    }

    /// 安装级：严格按序执行
    async fn install_stage(
        &self,
        mut rx: mpsc::Receiver<ResolvedAction>,
    ) -> Result<(), AgentError> {
        while let Some(resolved) = rx.recv().await {
            let name = resolved.action.service_name().to_string();
            if let Err(err) = self.apply_action(resolved).await {
                // 失败不阻塞队列，下个调和周期重试
                error!(service = %name, error = %err, "Action failed, continuing with next");
                self.context.app_status.update(
                    &name,
                    crate::domain::status::AppStatus {
                        installed: false,
                        running: false,
                        preparing: false,
                        disabled: false,
                    },
                );
            }
        }
        Ok(())
    }

    async fn apply_action(&self, resolved: ResolvedAction) -> Result<(), AgentError> {
        let action = resolved.action;
        let config = &action.status.configuration;
        let name = config.name.clone();

        match action.kind {
            ActionKind::Install => {
                // 静态资源包先于容器部分安装
                if !config.archives.is_empty() {
                    install_web_archives(&self.context, config).await?;
                }

                let Some(image_tag) = resolved.image_tag else {
                    debug!(service = %name, "Web-only service installed");
                    return Ok(());
                };

                let spec = self.build_spec(&name, image_tag, config).await;
                match self.cluster.create_service(&spec).await {
                    Ok(()) => info!(service = %name, "Service installed"),
                    Err(ClusterError::Conflict(_)) => {
                        debug!(service = %name, "Service already exists");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            ActionKind::Restart => {
                self.cluster.restart_service(&name).await?;
                info!(service = %name, "Service restarted");
            }
            ActionKind::Reconfigure => {
                let password_labels = password_labels(config);
                let (config_refs, secret_refs) =
                    self.store.current_refs_for(&name, &password_labels).await;
                self.cluster
                    .update_service_refs(&name, &config_refs, &secret_refs)
                    .await?;
                info!(service = %name, "Service credential references updated");
            }
        }
        Ok(())
    }

    /// 组装创建服务的完整 spec：声明的 env/mounts/constraints 加上
    /// 当前凭证引用和节点标识
    async fn build_spec(
        &self,
        name: &str,
        image_tag: String,
        config: &crate::domain::service::ServiceConfiguration,
    ) -> ResolvedServiceSpec {
        let identity = self.context.identity();
        let password_labels = password_labels(config);
        let (config_refs, secret_refs) =
            self.store.current_refs_for(name, &password_labels).await;

        let mut env: Vec<String> =
            config.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        env.push(format!("NODE_ID={}", identity.node_id));
        env.push(format!("NODE_HOSTNAME={}", identity.hostname));
        if let Some(network_id) = &identity.network_id {
            env.push(format!("NETWORK_ID={}", network_id));
        }

        let mut labels = HashMap::new();
        labels.insert("application".to_string(), name.to_string());
        labels.insert("node_id".to_string(), identity.node_id.clone());

        ResolvedServiceSpec {
            name: name.to_string(),
            image: image_tag,
            env,
            mounts: config.mounts.clone(),
            constraints: config.constraints.clone(),
            labels,
            config_refs,
            secret_refs,
            replicas: config.replicas.unwrap_or(1),
            networks: vec![self.context.config.swarm_network.clone()],
        }
    }
}

/// 服务声明的密码生成器标签
fn password_labels(config: &crate::domain::service::ServiceConfiguration) -> Vec<String> {
    config
        .generators
        .iter()
        .map(|generator: &PasswordGenerator| generator.label().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::domain::service::{ServiceConfiguration, ServiceStatus};
    use crate::infra::cluster::testing::FakeClusterClient;
    use crate::services::credentials::CredentialRetention;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn pipeline() -> (TempDir, Arc<FakeClusterClient>, InstallPipeline) {
        let dir = TempDir::new().unwrap();
        let config = EnvConfig::with_data_dir(PathBuf::from(dir.path()));
        let context = Arc::new(AgentContext::new(config).unwrap());
        let cluster = Arc::new(FakeClusterClient::new());
        let store = Arc::new(CredentialStore::new(
            cluster.clone(),
            dir.path().join("secrets"),
            CredentialRetention::Keep,
        ));
        let pipeline = InstallPipeline::new(context, cluster.clone(), store);
        (dir, cluster, pipeline)
    }

    fn install_action(name: &str) -> PlannedAction {
        let config: ServiceConfiguration = serde_json::from_str(&format!(
            r#"{{"name": "{}", "image": "registry/{}:1"}}"#,
            name, name
        ))
        .unwrap();
        PlannedAction { kind: ActionKind::Install, status: ServiceStatus::new(config) }
    }

    #[tokio::test]
    async fn test_installs_in_plan_order() {
        let (_dir, cluster, pipeline) = pipeline();
        cluster.add_pullable_image("registry/broker:1");
        cluster.add_pullable_image("registry/proxy:1");

        pipeline
            .run_cycle(vec![install_action("broker"), install_action("proxy")])
            .await
            .unwrap();

        let creates: Vec<String> = cluster
            .calls()
            .into_iter()
            .filter(|(action, _)| action == "create_service")
            .map(|(_, name)| name)
            .collect();
        assert_eq!(creates, vec!["broker".to_string(), "proxy".to_string()]);
    }

    #[tokio::test]
    async fn test_pull_failure_skips_only_that_action() {
        let (_dir, cluster, pipeline) = pipeline();
        // broker 镜像不可拉取，proxy 可用
        cluster.add_pullable_image("registry/proxy:1");

        pipeline
            .run_cycle(vec![install_action("broker"), install_action("proxy")])
            .await
            .unwrap();

        let services = cluster.state.lock().unwrap().services.clone();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "proxy");
    }

    #[tokio::test]
    async fn test_action_failure_does_not_abort_queue() {
        let (_dir, cluster, pipeline) = pipeline();
        cluster.add_pullable_image("registry/proxy:1");

        // broker 重启会失败（服务不存在），proxy 安装应照常进行
        let restart = PlannedAction {
            kind: ActionKind::Restart,
            status: ServiceStatus::new(
                serde_json::from_str(r#"{"name": "broker", "image": "registry/broker:1"}"#)
                    .unwrap(),
            ),
        };
        // broker 镜像在本地，避免解析级跳过
        cluster.state.lock().unwrap().local_images.push("registry/broker:1".to_string());

        pipeline
            .run_cycle(vec![restart, install_action("proxy")])
            .await
            .unwrap();

        let services = cluster.state.lock().unwrap().services.clone();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "proxy");
    }

    #[tokio::test]
    async fn test_existing_service_conflict_is_success() {
        let (_dir, cluster, pipeline) = pipeline();
        cluster.state.lock().unwrap().local_images.push("registry/proxy:1".to_string());
        cluster.add_service(crate::infra::cluster::ClusterService {
            name: "proxy".to_string(),
            ..Default::default()
        });

        pipeline.run_cycle(vec![install_action("proxy")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_plan_is_noop() {
        let (_dir, cluster, pipeline) = pipeline();
        pipeline.run_cycle(Vec::new()).await.unwrap();
        assert!(cluster.calls().is_empty());
    }
}
