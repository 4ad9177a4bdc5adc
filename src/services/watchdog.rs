//! 调和循环与重启看门狗
//!
//! 低频看门狗扫描应用状态里"未停用且未运行"的应用并触发调和；
//! 调和循环在触发信号和保底超时（默认 900 秒）之间等待，保证
//! 即使没有任何显式触发也会周期性自愈。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::catalog;
use crate::config::env::constants::{RECONCILE_CEILING_SECS, WATCHDOG_POLL_SECS};
use crate::domain::status::AppStatus;
use crate::error::AgentResult;
use crate::services::credentials::CredentialStore;
use crate::services::install::InstallPipeline;
use crate::services::reconciler::ServiceReconciler;
use crate::state::AgentContext;

/// 重启看门狗：发现停摆应用就触发调和
pub async fn restart_watchdog(context: Arc<AgentContext>) -> AgentResult<()> {
    loop {
        if !context.wait(Duration::from_secs(WATCHDOG_POLL_SECS)).await {
            return Ok(());
        }
        let stalled = context.app_status.stalled_apps();
        if !stalled.is_empty() {
            info!(stalled = ?stalled, "Watchdog found stopped applications");
            context.trigger_reconcile();
        }
    }
}

/// 调和循环
pub struct ReconcileLoop {
    context: Arc<AgentContext>,
    reconciler: Arc<ServiceReconciler>,
    pipeline: Arc<InstallPipeline>,
    store: Arc<CredentialStore>,
}

impl ReconcileLoop {
    pub fn new(
        context: Arc<AgentContext>,
        reconciler: Arc<ServiceReconciler>,
        pipeline: Arc<InstallPipeline>,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self { context, reconciler, pipeline, store }
    }

    pub async fn run(&self) -> AgentResult<()> {
        let stop = self.context.stop_token();
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = self.context.reconcile_triggered() => {
                    debug!("Reconciliation triggered");
                }
                _ = tokio::time::sleep(Duration::from_secs(RECONCILE_CEILING_SECS)) => {
                    debug!("Reconciliation ceiling timeout");
                }
            }

            if let Err(err) = self.run_cycle().await {
                // 瞬时错误：下个周期重试
                error!(error = %err, "Reconciliation cycle failed");
            }
        }
    }

    /// 一个完整调和周期：刷新凭证指针、计算计划、执行、上报状态
    pub async fn run_cycle(&self) -> AgentResult<()> {
        let required_files = self.context.app_status.required_modules();
        if required_files.is_empty() {
            return Ok(());
        }

        self.store.refresh().await?;

        let module_files: Vec<&str> = required_files.iter().map(String::as_str).collect();
        let mut required = catalog::load_required_modules(
            &self.context.config.catalog_dir,
            &module_files,
        );
        required.extend(catalog::load_application_dependencies(
            &self.context.config.catalog_dir,
        ));

        let plan = self.reconciler.compute_plan(&required).await?;
        self.pipeline.run_cycle(plan).await?;

        // 重建应用状态聚合（状态上报）
        let statuses = self.reconciler.derive_all_statuses(&required).await?;
        for status in statuses {
            self.context.app_status.update(
                status.name(),
                AppStatus {
                    installed: status.installed,
                    running: status.running,
                    preparing: status.preparing,
                    disabled: status.disabled(),
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::infra::cluster::testing::FakeClusterClient;
    use crate::services::credentials::CredentialRetention;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn reconcile_loop() -> (TempDir, Arc<AgentContext>, Arc<FakeClusterClient>, ReconcileLoop) {
        let dir = TempDir::new().unwrap();
        let config = EnvConfig::with_data_dir(PathBuf::from(dir.path()));
        let context = Arc::new(AgentContext::new(config.clone()).unwrap());
        let cluster = Arc::new(FakeClusterClient::new());
        let store = Arc::new(CredentialStore::new(
            cluster.clone(),
            config.secrets_dir.clone(),
            CredentialRetention::Keep,
        ));
        let reconciler = Arc::new(ServiceReconciler::new(cluster.clone(), store.clone()));
        let pipeline = Arc::new(InstallPipeline::new(
            context.clone(),
            cluster.clone(),
            store.clone(),
        ));
        let looper = ReconcileLoop::new(context.clone(), reconciler, pipeline, store);
        (dir, context, cluster, looper)
    }

    #[tokio::test]
    async fn test_cycle_installs_missing_and_reports_status() {
        let (_dir, context, cluster, looper) = reconcile_loop();

        fs::write(
            context.config.catalog_dir.join("docker.proxy.json"),
            r#"{"name": "proxy", "image": "registry/proxy:2"}"#,
        )
        .unwrap();
        context.app_status.set_required_modules(vec!["docker.proxy.json".to_string()]);
        cluster.add_pullable_image("registry/proxy:2");

        looper.run_cycle().await.unwrap();

        let services = cluster.state.lock().unwrap().services.clone();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "proxy");

        let status = context.app_status.get("proxy").unwrap();
        assert!(status.installed);
        assert!(status.running);
    }

    #[tokio::test]
    async fn test_cycle_without_required_modules_is_noop() {
        let (_dir, _context, cluster, looper) = reconcile_loop();
        looper.run_cycle().await.unwrap();
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_includes_application_dependencies() {
        let (_dir, context, cluster, looper) = reconcile_loop();

        fs::write(
            context.config.catalog_dir.join("docker.proxy.json"),
            r#"{"name": "proxy", "image": "registry/proxy:2"}"#,
        )
        .unwrap();
        fs::write(
            context.config.catalog_dir.join("app.notes.json"),
            r#"{"name": "notes", "dependencies": [{"name": "notes", "image": "registry/notes:1"}]}"#,
        )
        .unwrap();
        context.app_status.set_required_modules(vec!["docker.proxy.json".to_string()]);
        cluster.add_pullable_image("registry/proxy:2");
        cluster.add_pullable_image("registry/notes:1");

        looper.run_cycle().await.unwrap();

        let services = cluster.state.lock().unwrap().services.clone();
        let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"proxy"));
        assert!(names.contains(&"notes"));
    }
}
