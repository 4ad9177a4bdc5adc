//! 消息总线边界
//!
//! 传输层是外部协作者：入站消息已经过认证和解析，附带身份
//! （角色、安全交换、全局委托标志）。这里只做角色/交换/委托值的
//! 检查并分发到对应处理器。

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::catalog::AppDescriptor;
use crate::domain::security::SecurityLevel;
use crate::error::AgentError;
use crate::services::apps::{ApplicationsHandler, CommandResult};
use crate::state::AgentContext;

/// 入站消息附带的已认证身份
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BusIdentity {
    #[serde(default)]
    pub roles: Vec<String>,
    /// 身份可访问的安全交换
    #[serde(default)]
    pub exchanges: Vec<String>,
    /// 全局委托标志（"owner" 拥有全部权限）
    pub global_delegation: Option<String>,
}

impl BusIdentity {
    /// 是否为平台所有者
    pub fn is_owner(&self) -> bool {
        self.global_delegation.as_deref() == Some("owner")
    }

    /// 是否可访问给定安全级别的交换
    pub fn has_exchange(&self, level: SecurityLevel) -> bool {
        self.exchanges.iter().any(|e| e == level.as_str())
    }
}

/// 已认证、已解析的入站请求
#[derive(Clone, Debug)]
pub struct BusRequest {
    pub action: String,
    pub identity: BusIdentity,
    pub payload: Value,
}

/// 总线注册能力：runlevel 控制器驱动注册/注销
#[async_trait]
pub trait BusRegistration: Send + Sync {
    async fn register(&self) -> Result<(), AgentError>;
    async fn unregister(&self) -> Result<(), AgentError>;
}

/// 总线事件发布能力（在线状态等）
#[async_trait]
pub trait BusProducer: Send + Sync {
    async fn emit_event(
        &self,
        domain: &str,
        action: &str,
        exchange: &str,
        payload: Value,
    ) -> Result<(), AgentError>;
}

/// 不连接任何总线的空实现
///
/// 传输层在部署时由外部提供；没有配置总线的节点（以及测试）
/// 使用这个实现，注册与事件都只留下日志。
pub struct NullBusTransport;

#[async_trait]
impl BusRegistration for NullBusTransport {
    async fn register(&self) -> Result<(), AgentError> {
        info!("Bus transport disabled, skipping registration");
        Ok(())
    }

    async fn unregister(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

#[async_trait]
impl BusProducer for NullBusTransport {
    async fn emit_event(
        &self,
        _domain: &str,
        action: &str,
        _exchange: &str,
        _payload: Value,
    ) -> Result<(), AgentError> {
        tracing::debug!(action, "Bus transport disabled, event dropped");
        Ok(())
    }
}

/// 命令分发器
pub struct BusDispatcher {
    context: Arc<AgentContext>,
    apps: Arc<ApplicationsHandler>,
}

impl BusDispatcher {
    pub fn new(context: Arc<AgentContext>, apps: Arc<ApplicationsHandler>) -> Self {
        Self { context, apps }
    }

    /// 处理一条入站请求，返回应答载荷
    pub async fn handle(&self, request: BusRequest) -> Result<Value, AgentError> {
        info!(action = %request.action, "Handling bus request");

        match request.action.as_str() {
            "installApplication" => {
                self.require_command_access(&request)?;
                let descriptor = parse_descriptor(&request.payload)?;
                let result = self.apps.install_application(descriptor, false).await?;
                Ok(serde_json::to_value(result)?)
            }
            "upgradeApplication" => {
                self.require_command_access(&request)?;
                let descriptor = parse_descriptor(&request.payload)?;
                let result = self.apps.upgrade_application(descriptor).await?;
                Ok(serde_json::to_value(result)?)
            }
            "removeApplication" => {
                self.require_command_access(&request)?;
                let name = parse_app_name(&request.payload)?;
                let result = self.apps.remove_application(&name).await?;
                Ok(serde_json::to_value(result)?)
            }
            "startApplication" => {
                self.require_command_access(&request)?;
                let name = parse_app_name(&request.payload)?;
                let result = self.apps.start_application(&name).await?;
                Ok(serde_json::to_value(result)?)
            }
            "stopApplication" => {
                self.require_command_access(&request)?;
                let name = parse_app_name(&request.payload)?;
                let result = self.apps.stop_application(&name).await?;
                Ok(serde_json::to_value(result)?)
            }
            "getPasswords" => self.get_passwords(&request),
            "transmitCatalogues" => self.transmit_catalogues(&request),
            other => {
                warn!(action = %other, "Ignoring unknown bus action");
                Ok(serde_json::to_value(CommandResult::err("unknown action"))?)
            }
        }
    }

    /// 应用命令要求：owner 委托，或身份能访问本节点路由级别的交换
    fn require_command_access(&self, request: &BusRequest) -> Result<(), AgentError> {
        if request.identity.is_owner() {
            return Ok(());
        }
        let level = self
            .context
            .identity()
            .security
            .map(|s| s.routing_level())
            .unwrap_or(SecurityLevel::Public);
        if request.identity.has_exchange(level) {
            return Ok(());
        }
        Err(AgentError::configuration("access denied"))
    }

    /// 读取本地密码文件（仅 owner 委托）
    fn get_passwords(&self, request: &BusRequest) -> Result<Value, AgentError> {
        if !request.identity.is_owner() {
            return Ok(serde_json::to_value(CommandResult::err("access denied"))?);
        }

        let mut secrets = serde_json::Map::new();
        let entries = match fs::read_dir(&self.context.config.secrets_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(serde_json::json!({ "secrets": secrets })),
        };
        for entry in entries.flatten() {
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.starts_with("passwd.") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(entry.path()) {
                secrets.insert(filename, Value::String(content.trim().to_string()));
            }
        }
        Ok(serde_json::json!({ "secrets": secrets }))
    }

    /// 目录包传输只允许 protected 交换
    fn transmit_catalogues(&self, request: &BusRequest) -> Result<Value, AgentError> {
        let allowed = request.identity.is_owner()
            || request.identity.has_exchange(SecurityLevel::Protected);
        if !allowed {
            return Ok(serde_json::to_value(CommandResult::err("access denied"))?);
        }
        // 目录文件的生成与发送属于外部协作者；这里只确认接收
        info!("Catalogue transmission acknowledged");
        Ok(serde_json::to_value(CommandResult::ok())?)
    }
}

fn parse_descriptor(payload: &Value) -> Result<AppDescriptor, AgentError> {
    let configuration = payload
        .get("configuration")
        .ok_or_else(|| AgentError::configuration("missing configuration"))?;
    Ok(serde_json::from_value(configuration.clone())?)
}

fn parse_app_name(payload: &Value) -> Result<String, AgentError> {
    payload
        .get("application")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| AgentError::configuration("missing application name"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_owner_and_exchange_checks() {
        let owner = BusIdentity {
            global_delegation: Some("owner".to_string()),
            ..Default::default()
        };
        assert!(owner.is_owner());

        let operator = BusIdentity {
            roles: vec!["operator".to_string()],
            exchanges: vec!["protected".to_string()],
            global_delegation: None,
        };
        assert!(!operator.is_owner());
        assert!(operator.has_exchange(SecurityLevel::Protected));
        assert!(!operator.has_exchange(SecurityLevel::Secure));
    }

    #[test]
    fn test_parse_app_name() {
        let payload = serde_json::json!({"application": "notes"});
        assert_eq!(parse_app_name(&payload).unwrap(), "notes");
        assert!(parse_app_name(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_descriptor() {
        let payload = serde_json::json!({
            "configuration": {
                "name": "notes",
                "dependencies": [{"name": "notes", "image": "registry/notes:1"}]
            }
        });
        let descriptor = parse_descriptor(&payload).unwrap();
        assert_eq!(descriptor.name, "notes");
        assert_eq!(descriptor.dependencies.len(), 1);
    }

    mod dispatch {
        use super::*;
        use crate::config::EnvConfig;
        use crate::infra::cluster::testing::FakeClusterClient;
        use crate::services::certificates::testing::FakeIssuer;
        use crate::services::certificates::CertificateLifecycle;
        use crate::services::credentials::{CredentialRetention, CredentialStore};
        use crate::services::install::InstallPipeline;
        use std::path::PathBuf;
        use std::sync::Arc;
        use tempfile::TempDir;

        fn dispatcher() -> (TempDir, Arc<FakeClusterClient>, BusDispatcher) {
            let dir = TempDir::new().unwrap();
            let config = EnvConfig::with_data_dir(PathBuf::from(dir.path()));
            let context = Arc::new(crate::state::AgentContext::new(config.clone()).unwrap());
            let cluster = Arc::new(FakeClusterClient::new());
            let store = Arc::new(CredentialStore::new(
                cluster.clone(),
                config.secrets_dir.clone(),
                CredentialRetention::Keep,
            ));
            let lifecycle = Arc::new(CertificateLifecycle::new(
                context.clone(),
                Arc::new(FakeIssuer::new()),
                store.clone(),
            ));
            let pipeline = Arc::new(InstallPipeline::new(
                context.clone(),
                cluster.clone(),
                store,
            ));
            let apps = Arc::new(ApplicationsHandler::new(
                context.clone(),
                cluster.clone(),
                lifecycle,
                pipeline,
            ));
            (dir, cluster.clone(), BusDispatcher::new(context, apps))
        }

        fn install_request(identity: BusIdentity) -> BusRequest {
            BusRequest {
                action: "installApplication".to_string(),
                identity,
                payload: serde_json::json!({
                    "configuration": {
                        "name": "notes",
                        "dependencies": [{"name": "notes", "image": "registry/notes:1"}]
                    }
                }),
            }
        }

        #[tokio::test]
        async fn test_install_requires_access() {
            let (_dir, _cluster, dispatcher) = dispatcher();
            let result = dispatcher.handle(install_request(BusIdentity::default())).await;
            assert!(result.is_err());
        }

        #[tokio::test]
        async fn test_owner_can_install() {
            let (_dir, cluster, dispatcher) = dispatcher();
            cluster.add_pullable_image("registry/notes:1");

            let owner = BusIdentity {
                global_delegation: Some("owner".to_string()),
                ..Default::default()
            };
            let response = dispatcher.handle(install_request(owner)).await.unwrap();
            assert_eq!(response["ok"], serde_json::json!(true));

            let services = cluster.state.lock().unwrap().services.clone();
            assert_eq!(services.len(), 1);
            assert_eq!(services[0].name, "notes");
        }

        #[tokio::test]
        async fn test_get_passwords_requires_owner_delegation() {
            let (_dir, _cluster, dispatcher) = dispatcher();
            let request = BusRequest {
                action: "getPasswords".to_string(),
                identity: BusIdentity {
                    exchanges: vec!["protected".to_string()],
                    ..Default::default()
                },
                payload: serde_json::json!({}),
            };
            let response = dispatcher.handle(request).await.unwrap();
            assert_eq!(response["ok"], serde_json::json!(false));
        }

        #[tokio::test]
        async fn test_unknown_action_is_reported() {
            let (_dir, _cluster, dispatcher) = dispatcher();
            let request = BusRequest {
                action: "selfDestruct".to_string(),
                identity: BusIdentity::default(),
                payload: serde_json::json!({}),
            };
            let response = dispatcher.handle(request).await.unwrap();
            assert_eq!(response["ok"], serde_json::json!(false));
        }
    }
}
