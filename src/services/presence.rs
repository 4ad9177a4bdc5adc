//! 节点在线状态上报
//!
//! 周期性构造在线载荷（主机名、IP、安全级别、磁盘与负载、已配置
//! 应用）并通过总线发布。secure 节点按 protected 交换发布
//! （路由降级兼容规则）。

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tracing::debug;

use crate::config::catalog;
use crate::config::env::constants::PRESENCE_INTERVAL_SECS;
use crate::error::AgentResult;
use crate::services::bus::BusProducer;
use crate::state::AgentContext;

/// 在线载荷
#[derive(Clone, Debug, Serialize)]
pub struct PresencePayload {
    pub node_id: String,
    pub hostname: String,
    pub ip: Option<String>,
    pub security: Option<String>,
    pub runlevel: String,
    pub disk: Vec<DiskUsage>,
    pub load_average: [f64; 3],
    pub applications: Vec<ApplicationPresence>,
}

/// 单个分区用量
#[derive(Clone, Debug, Serialize)]
pub struct DiskUsage {
    pub mountpoint: String,
    pub free: u64,
    pub total: u64,
}

/// 已配置应用与最近状态
#[derive(Clone, Debug, Serialize)]
pub struct ApplicationPresence {
    pub name: String,
    pub version: Option<String>,
    pub running: bool,
    pub disabled: bool,
}

/// 构造一次在线载荷
pub fn build_payload(context: &AgentContext) -> PresencePayload {
    let identity = context.identity();
    let snapshot = context.app_status.snapshot();

    let applications = catalog::list_installed_applications(&context.config.catalog_dir)
        .into_iter()
        .map(|(name, version)| {
            let status = snapshot.apps.get(&name);
            ApplicationPresence {
                version,
                running: status.map(|s| s.running).unwrap_or(false),
                disabled: status.map(|s| s.disabled).unwrap_or(false),
                name,
            }
        })
        .collect();

    PresencePayload {
        node_id: identity.node_id,
        hostname: identity.hostname,
        ip: identity.ip_address,
        security: identity.security.map(|s| s.as_str().to_string()),
        runlevel: context.runlevel().as_str().to_string(),
        disk: disk_usage(),
        load_average: load_average(),
        applications,
    }
}

fn disk_usage() -> Vec<DiskUsage> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .map(|disk| DiskUsage {
            mountpoint: disk.mount_point().to_string_lossy().to_string(),
            free: disk.available_space(),
            total: disk.total_space(),
        })
        .collect()
}

fn load_average() -> [f64; 3] {
    let load = System::load_average();
    [load.one, load.five, load.fifteen]
}

/// 在线状态上报循环
pub async fn presence_loop(
    context: Arc<AgentContext>,
    producer: Arc<dyn BusProducer>,
) -> AgentResult<()> {
    loop {
        if !context.wait(Duration::from_secs(PRESENCE_INTERVAL_SECS)).await {
            return Ok(());
        }

        let identity = context.identity();
        let Some(security) = identity.security else {
            continue; // 安装模式没有总线
        };

        let payload = build_payload(&context);
        let value: Value = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "Failed to serialize presence payload");
                continue;
            }
        };

        // 瞬时发送失败只记录，不影响循环
        if let Err(err) = producer
            .emit_event("node", "presence", security.routing_level().as_str(), value)
            .await
        {
            debug!(error = %err, "Failed to emit presence event");
        }
    }
}
