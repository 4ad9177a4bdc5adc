//! Runlevel 状态机
//!
//! 节点当前生命周期阶段，决定允许运行的服务集。转换函数是纯函数：
//! 只依赖 (security level, certificate expired, orchestrator present)。

use serde::Serialize;

use crate::domain::security::SecurityLevel;
use crate::error::AgentError;

/// 节点 runlevel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Runlevel {
    /// 尚未完成首次配置加载
    Init,
    /// 未配置安全级别，等待管理员完成安装
    Installing,
    /// 节点自身证书缺失或过期，自动续期不可用
    CertificateExpired,
    /// 一切正常，保持运行直到停止
    Normal,
}

impl Runlevel {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            Runlevel::Init => "init",
            Runlevel::Installing => "installing",
            Runlevel::CertificateExpired => "certificate_expired",
            Runlevel::Normal => "normal",
        }
    }
}

impl std::fmt::Display for Runlevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 计算适用的 runlevel
///
/// protected/secure 节点没有编排器是不支持的配置，直接报错而不是
/// 尝试降级运行。
pub fn compute_runlevel(
    security: Option<SecurityLevel>,
    certificate_expired: bool,
    cluster_available: bool,
) -> Result<Runlevel, AgentError> {
    if let Some(level) = security {
        if level.is_protected() && !cluster_available {
            return Err(AgentError::UnsupportedTopology(format!(
                "security level {} requires an orchestrator",
                level
            )));
        }
    }

    match security {
        None => Ok(Runlevel::Installing),
        Some(_) if certificate_expired => Ok(Runlevel::CertificateExpired),
        Some(_) => Ok(Runlevel::Normal),
    }
}
