//! 统一错误类型
//!
//! 区分四类错误：集群瞬时错误（下个周期重试）、配置错误（保持当前
//! runlevel）、凭证错误（只影响单个安装动作）、以及不可分类错误
//! （升级为进程终止）。

use thiserror::Error;

use crate::infra::cluster::ClusterError;
use crate::infra::issuer::IssuerError;

/// Agent 级错误
#[derive(Debug, Error)]
pub enum AgentError {
    /// 集群 API 错误（瞬时，下个调和周期重试）
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// 配置错误（缺少必须文件、不支持的组合）
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 不支持的拓扑（protected/secure 节点没有编排器）
    #[error("unsupported topology: {0}")]
    UnsupportedTopology(String),

    /// 凭证错误（只影响单个安装动作）
    #[error("credential error: {0}")]
    Credential(String),

    /// 证书签发边界错误
    #[error("certificate issuer error: {0}")]
    Issuer(#[from] IssuerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// 受监督任务失败（触发进程终止）
    #[error("task failure: {0}")]
    Task(String),
}

impl AgentError {
    /// 创建配置错误
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// 创建凭证错误
    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential(message.into())
    }

    /// 是否为致命错误（需要终止进程）
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Task(_))
    }
}

/// 便捷类型别名
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = AgentError::configuration("missing node.security");
        assert!(err.to_string().contains("missing node.security"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_task_error_is_fatal() {
        assert!(AgentError::Task("watchdog died".to_string()).is_fatal());
    }
}
