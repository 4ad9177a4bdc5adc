//! 安全级别
//!
//! 有序信任级别，决定必须模块集和消息路由范围。

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 节点安全级别，从低到高排序
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Public,
    Private,
    Protected,
    Secure,
}

impl SecurityLevel {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Public => "public",
            SecurityLevel::Private => "private",
            SecurityLevel::Protected => "protected",
            SecurityLevel::Secure => "secure",
        }
    }

    /// 消息路由级别
    ///
    /// secure 节点在消息路由和模块选择上降级为 protected。
    /// 这是刻意的兼容规则，不是缺陷。
    pub fn routing_level(&self) -> SecurityLevel {
        match self {
            SecurityLevel::Secure => SecurityLevel::Protected,
            other => *other,
        }
    }

    /// 是否运行受保护的中间件（broker、database、gateway）
    pub fn is_protected(&self) -> bool {
        matches!(self, SecurityLevel::Protected | SecurityLevel::Secure)
    }
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "public" => Ok(SecurityLevel::Public),
            "private" => Ok(SecurityLevel::Private),
            "protected" => Ok(SecurityLevel::Protected),
            "secure" => Ok(SecurityLevel::Secure),
            other => Err(format!("unknown security level: {}", other)),
        }
    }
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(SecurityLevel::Public < SecurityLevel::Private);
        assert!(SecurityLevel::Private < SecurityLevel::Protected);
        assert!(SecurityLevel::Protected < SecurityLevel::Secure);
    }

    #[test]
    fn test_secure_routes_as_protected() {
        assert_eq!(SecurityLevel::Secure.routing_level(), SecurityLevel::Protected);
        assert_eq!(SecurityLevel::Public.routing_level(), SecurityLevel::Public);
    }

    #[test]
    fn test_parse() {
        assert_eq!("protected".parse::<SecurityLevel>().unwrap(), SecurityLevel::Protected);
        assert_eq!(" secure ".parse::<SecurityLevel>().unwrap(), SecurityLevel::Secure);
        assert!("3.protege".parse::<SecurityLevel>().is_err());
    }
}
