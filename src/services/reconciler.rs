//! 服务调和
//!
//! 对照必须模块列表和集群实时状态，计算缺失/停止/过期的服务，
//! 按固定优先级排序输出修正计划。

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::modules::priority_rank;
use crate::domain::service::{ActionKind, PlannedAction, ServiceConfiguration, ServiceStatus};
use crate::error::AgentError;
use crate::infra::cluster::{ClusterClient, ClusterService};
use crate::services::credentials::CredentialStore;

/// 服务调和器
pub struct ServiceReconciler {
    cluster: Arc<dyn ClusterClient>,
    store: Arc<CredentialStore>,
}

impl ServiceReconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>, store: Arc<CredentialStore>) -> Self {
        Self { cluster, store }
    }

    /// 计算一次调和计划
    ///
    /// 对同样的 (必须模块, 集群状态) 连续计算两次，第二次计划为空
    /// （幂等）。
    pub async fn compute_plan(
        &self,
        required: &[ServiceConfiguration],
    ) -> Result<Vec<PlannedAction>, AgentError> {
        let live = self.cluster.list_services(None).await?;
        let statuses = derive_statuses(required, &live);

        let mut actions = Vec::new();
        for status in statuses {
            let Some(kind) = self.classify(&status, &live).await else {
                continue;
            };
            actions.push(PlannedAction { kind, status });
        }

        sort_by_priority(&mut actions);
        if !actions.is_empty() {
            info!(
                actions = actions.len(),
                plan = ?actions.iter().map(|a| (a.kind, a.service_name().to_string())).collect::<Vec<_>>(),
                "Computed reconciliation plan"
            );
        }
        Ok(actions)
    }

    /// 派生所有必须服务的状态视图（看门狗和在线上报消费）
    pub async fn derive_all_statuses(
        &self,
        required: &[ServiceConfiguration],
    ) -> Result<Vec<ServiceStatus>, AgentError> {
        let live = self.cluster.list_services(None).await?;
        Ok(derive_statuses(required, &live))
    }

    async fn classify(
        &self,
        status: &ServiceStatus,
        live: &[ClusterService],
    ) -> Option<ActionKind> {
        if let Err(err) = status.configuration.validate() {
            // 无镜像也无资源包：无法安装，只记录错误
            error!(service = %status.name(), error = %err, "Invalid service configuration");
            return None;
        }

        if status.disabled() {
            // 人工停用，绝不自动操作
            return None;
        }

        if !status.installed {
            return Some(ActionKind::Install);
        }

        if status.preparing && !status.running {
            debug!(service = %status.name(), "Service is preparing, waiting");
            return None;
        }

        if !status.running {
            return Some(ActionKind::Restart);
        }

        // 运行中：检查凭证引用是否为 current
        let service = live.iter().find(|s| s.name == status.name())?;
        if !self.store.is_current(&service.spec_refs()).await {
            info!(service = %status.name(), "Service references stale credentials");
            return Some(ActionKind::Reconfigure);
        }

        None
    }
}

/// 对照实时服务列表派生状态
fn derive_statuses(
    required: &[ServiceConfiguration],
    live: &[ClusterService],
) -> Vec<ServiceStatus> {
    let live_by_name: HashMap<&str, &ClusterService> =
        live.iter().map(|s| (s.name.as_str(), s)).collect();

    required
        .iter()
        .map(|config| {
            let mut status = ServiceStatus::new(config.clone());
            if let Some(service) = live_by_name.get(config.name.as_str()) {
                status.installed = true;
                status.running = service.is_running();
                status.preparing = service.is_preparing();
                status.replicas = service.replicas;
            }
            status
        })
        .collect()
}

/// 固定优先级列表中的模块排最前（保持列表内相对顺序），
/// 其余按输入顺序稳定排列。
fn sort_by_priority(actions: &mut [PlannedAction]) {
    actions.sort_by_key(|action| {
        priority_rank(action.service_name()).unwrap_or(usize::MAX)
    });
}
