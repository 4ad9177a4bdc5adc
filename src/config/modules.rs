//! 必须模块表
//!
//! 每个 (runlevel, security level) 组合对应一组静态的模块配置文件
//! 标识。文件名形如 `docker.<name>.json`，服务名即 `<name>`。

use crate::domain::runlevel::Runlevel;
use crate::domain::security::SecurityLevel;

/// 安装模式：只运行反向代理安装器和证书签发器
pub const MODULES_INSTALLATION: &[&str] = &["docker.certissuer.json", "docker.proxyinstall.json"];

/// 证书过期恢复（protected/secure）：需要签发器来续期
pub const MODULES_EXPIRED_PROTECTED: &[&str] =
    &["docker.certissuer.json", "docker.proxy.json"];

/// 证书过期恢复（public/private）：只需要反向代理
pub const MODULES_EXPIRED: &[&str] = &["docker.proxy.json"];

/// 正常运行，public 级别
pub const MODULES_PUBLIC: &[&str] = &[
    "docker.proxy.json",
    "docker.cache.json",
    "docker.webauth.json",
];

/// 正常运行，private 级别
pub const MODULES_PRIVATE: &[&str] = &[
    "docker.proxy.json",
    "docker.cache.json",
    "docker.webauth.json",
    "docker.collector.json",
];

/// 正常运行，protected 级别（带总线与数据库的完整中间件）
pub const MODULES_PROTECTED: &[&str] = &[
    "docker.certissuer.json",
    "docker.proxy.json",
    "docker.cache.json",
    "docker.webauth.json",
    "docker.collector.json",
    "docker.broker.json",
    "docker.database.json",
    "docker.gateway.json",
    "docker.scheduler.json",
];

/// 正常运行，secure 级别：protected 加上密钥主模块
pub const MODULES_SECURE: &[&str] = &[
    "docker.certissuer.json",
    "docker.proxy.json",
    "docker.cache.json",
    "docker.webauth.json",
    "docker.collector.json",
    "docker.broker.json",
    "docker.database.json",
    "docker.gateway.json",
    "docker.scheduler.json",
    "docker.keymaster.json",
];

/// 固定优先级列表：其他服务在启动时隐式依赖它们
/// （需要新签发证书的服务要求签发器和到 broker 的安全通道已就绪）
pub const PRIORITY_MODULES: &[&str] =
    &["broker", "database", "certissuer", "gateway", "proxy", "cache"];

/// 返回 (runlevel, security) 组合的必须模块表
///
/// Init 没有必须模块；Installing 使用最小安装集。
pub fn required_modules(runlevel: Runlevel, security: Option<SecurityLevel>) -> &'static [&'static str] {
    match runlevel {
        Runlevel::Init => &[],
        Runlevel::Installing => MODULES_INSTALLATION,
        Runlevel::CertificateExpired => match security {
            Some(SecurityLevel::Protected) | Some(SecurityLevel::Secure) => {
                MODULES_EXPIRED_PROTECTED
            }
            _ => MODULES_EXPIRED,
        },
        Runlevel::Normal => match security {
            Some(SecurityLevel::Public) | None => MODULES_PUBLIC,
            Some(SecurityLevel::Private) => MODULES_PRIVATE,
            Some(SecurityLevel::Protected) => MODULES_PROTECTED,
            Some(SecurityLevel::Secure) => MODULES_SECURE,
        },
    }
}

/// 模块配置文件名 -> 服务名（`docker.proxy.json` -> `proxy`）
pub fn module_service_name(module_file: &str) -> &str {
    module_file
        .strip_prefix("docker.")
        .and_then(|s| s.strip_suffix(".json"))
        .unwrap_or(module_file)
}

/// 服务在固定优先级列表中的位置，不在列表中返回 None
pub fn priority_rank(service_name: &str) -> Option<usize> {
    PRIORITY_MODULES.iter().position(|m| *m == service_name)
}
