//! 带日期的凭证对象命名
//!
//! 每个凭证作为不可变的集群 config/secret 对象存在，名称为
//! `<logical>.<kind>.<YYYYmmddHHMMSS>`。每个逻辑名同一时间最多
//! 只有一个对象被视为 current（记录中最新创建的那个）。

use chrono::{DateTime, NaiveDateTime, Utc};

/// 凭证时间戳格式（秒分辨率）
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// 凭证种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    Cert,
    Key,
    Password,
}

impl CredentialKind {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Cert => "cert",
            CredentialKind::Key => "key",
            CredentialKind::Password => "password",
        }
    }

    /// 是否存为 secret（私钥和密码），否则存为 config
    pub fn is_secret(&self) -> bool {
        matches!(self, CredentialKind::Key | CredentialKind::Password)
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "cert" => Some(CredentialKind::Cert),
            "key" => Some(CredentialKind::Key),
            "password" => Some(CredentialKind::Password),
            _ => None,
        }
    }
}

/// 解析后的带日期对象名
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatedObjectName {
    /// 逻辑名（如 `pki.broker`、`passwd.database`）
    pub logical: String,
    pub kind: CredentialKind,
    /// `%Y%m%d%H%M%S` 时间戳
    pub timestamp: String,
}

impl DatedObjectName {
    /// 构造对象名
    pub fn build(logical: &str, kind: CredentialKind, issued_at: DateTime<Utc>) -> Self {
        Self {
            logical: logical.to_string(),
            kind,
            timestamp: issued_at.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// 完整对象名
    pub fn object_name(&self) -> String {
        format!("{}.{}.{}", self.logical, self.kind.as_str(), self.timestamp)
    }

    /// current 指针的键（逻辑名 + 种类）
    pub fn pointer_key(&self) -> String {
        format!("{}.{}", self.logical, self.kind.as_str())
    }

    /// 从对象名解析
    ///
    /// 无法识别的名称返回 None（向前兼容：非托管对象被忽略）。
    pub fn parse(name: &str) -> Option<Self> {
        let (rest, timestamp) = name.rsplit_once('.')?;
        if timestamp.len() != 14 || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let (logical, kind_str) = rest.rsplit_once('.')?;
        let kind = CredentialKind::parse(kind_str)?;
        if logical.is_empty() {
            return None;
        }
        Some(Self {
            logical: logical.to_string(),
            kind,
            timestamp: timestamp.to_string(),
        })
    }

    /// 解析时间戳
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_build_and_parse_roundtrip() {
        let issued = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let name = DatedObjectName::build("pki.broker", CredentialKind::Cert, issued);
        assert_eq!(name.object_name(), "pki.broker.cert.20230601000000");

        let parsed = DatedObjectName::parse("pki.broker.cert.20230601000000").unwrap();
        assert_eq!(parsed, name);
        assert_eq!(parsed.issued_at().unwrap(), issued);
        assert_eq!(parsed.pointer_key(), "pki.broker.cert");
    }

    #[test]
    fn test_parse_password_secret() {
        let parsed = DatedObjectName::parse("passwd.database.password.20240211093000").unwrap();
        assert_eq!(parsed.logical, "passwd.database");
        assert_eq!(parsed.kind, CredentialKind::Password);
        assert!(parsed.kind.is_secret());
    }

    #[test]
    fn test_unrecognized_names_ignored() {
        assert!(DatedObjectName::parse("node.id").is_none());
        assert!(DatedObjectName::parse("pki.broker.cert").is_none());
        assert!(DatedObjectName::parse("pki.broker.cert.notadate12345").is_none());
        assert!(DatedObjectName::parse("pki.broker.pem.20230601000000").is_none());
        assert!(DatedObjectName::parse("").is_none());
    }

    #[test]
    fn test_cert_is_config_key_is_secret() {
        assert!(!CredentialKind::Cert.is_secret());
        assert!(CredentialKind::Key.is_secret());
        assert!(CredentialKind::Password.is_secret());
    }
}
