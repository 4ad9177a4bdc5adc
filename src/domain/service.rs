//! 服务相关领域模型

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::AgentError;

/// 单个可部署单元的声明式描述
///
/// 对应一个 `docker.<name>.json` 模块文件或应用描述文件中的一个依赖。
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceConfiguration {
    pub name: String,
    /// 容器镜像，纯 web 应用可以没有
    pub image: Option<String>,
    /// 声明的证书依赖
    pub certificate: Option<CertificateRequest>,
    /// 声明的密码生成器
    #[serde(default)]
    pub generators: Vec<PasswordGenerator>,
    /// 环境变量
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// 挂载（`source:target` 形式，直接传给编排器）
    #[serde(default)]
    pub mounts: Vec<String>,
    /// 放置约束
    #[serde(default)]
    pub constraints: Vec<String>,
    /// nginx 配置片段（由外部协作者处理，这里只透传）
    pub nginx: Option<serde_json::Value>,
    /// 非容器化静态资源包
    #[serde(default)]
    pub archives: Vec<WebArchive>,
    /// 安装脚本（在资源包安装后执行）
    #[serde(default)]
    pub install_scripts: Vec<String>,
    /// 副本数，缺省为 1；显式 0 表示人工停用
    pub replicas: Option<u64>,
}

impl ServiceConfiguration {
    /// 校验配置：没有镜像也没有资源包的服务无法安装
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.image.is_none() && self.archives.is_empty() {
            return Err(AgentError::configuration(format!(
                "service {} declares neither an image nor an archive",
                self.name
            )));
        }
        Ok(())
    }

    /// 是否为纯 web 应用（没有容器部分）
    pub fn web_only(&self) -> bool {
        self.image.is_none() && !self.archives.is_empty()
    }
}

/// 证书依赖声明，内容透传给签发器
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CertificateRequest {
    #[serde(default)]
    pub roles: Vec<String>,
    /// DNS 配置（`domain: true` 表示附加节点域名）
    pub dns: Option<serde_json::Value>,
    /// 私钥与证书合并写入同一个文件
    #[serde(default)]
    pub combine_keycert: bool,
}

/// 密码生成器声明
///
/// 模块文件里可以是纯标签字符串，也可以带类型和长度。
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PasswordGenerator {
    Label(String),
    Full {
        label: String,
        #[serde(rename = "type", default)]
        kind: Option<String>,
        size: Option<usize>,
    },
}

impl PasswordGenerator {
    /// 生成器标签
    pub fn label(&self) -> &str {
        match self {
            PasswordGenerator::Label(label) => label,
            PasswordGenerator::Full { label, .. } => label,
        }
    }
}

/// 非容器化静态资源包
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebArchive {
    /// 下载地址
    pub location: String,
    /// 内容摘要（sha256 hex）
    pub digest: String,
}

/// 服务对照集群实时状态的派生视图
///
/// 每个调和周期重新计算，从不持久化。
#[derive(Clone, Debug)]
pub struct ServiceStatus {
    pub configuration: ServiceConfiguration,
    pub installed: bool,
    pub running: bool,
    pub preparing: bool,
    pub replicas: Option<u64>,
}

impl ServiceStatus {
    /// 从配置构造未安装状态
    pub fn new(configuration: ServiceConfiguration) -> Self {
        Self {
            configuration,
            installed: false,
            running: false,
            preparing: false,
            replicas: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.configuration.name
    }

    /// 副本数显式为 0：人工停用，绝不自动重启
    pub fn disabled(&self) -> bool {
        self.replicas == Some(0)
    }

    pub fn web_only(&self) -> bool {
        self.configuration.web_only()
    }
}

/// 调和计划中的动作种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// 服务缺失，创建
    Install,
    /// 服务已停止，重启
    Restart,
    /// 凭证引用过期，只更新 config/secret 引用，保持镜像
    Reconfigure,
}

/// 调和计划中的一个动作
#[derive(Clone, Debug)]
pub struct PlannedAction {
    pub kind: ActionKind,
    pub status: ServiceStatus,
}

impl PlannedAction {
    pub fn service_name(&self) -> &str {
        self.status.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(name: &str, image: Option<&str>) -> ServiceConfiguration {
        ServiceConfiguration {
            name: name.to_string(),
            image: image.map(|s| s.to_string()),
            certificate: None,
            generators: Vec::new(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            constraints: Vec::new(),
            nginx: None,
            archives: Vec::new(),
            install_scripts: Vec::new(),
            replicas: None,
        }
    }

    #[test]
    fn test_validate_requires_image_or_archive() {
        assert!(minimal("broker", Some("registry/broker:1")).validate().is_ok());
        assert!(minimal("empty", None).validate().is_err());

        let mut webapp = minimal("webapp", None);
        webapp.archives.push(WebArchive {
            location: "https://packages.local/webapp.tar.gz".to_string(),
            digest: "abc123".to_string(),
        });
        assert!(webapp.validate().is_ok());
        assert!(webapp.web_only());
    }

    #[test]
    fn test_disabled_status() {
        let mut status = ServiceStatus::new(minimal("cache", Some("registry/cache:7")));
        assert!(!status.disabled());
        status.replicas = Some(0);
        assert!(status.disabled());
        status.replicas = Some(1);
        assert!(!status.disabled());
    }

    #[test]
    fn test_generator_forms_deserialize() {
        let plain: PasswordGenerator = serde_json::from_str("\"database\"").unwrap();
        assert_eq!(plain.label(), "database");

        let full: PasswordGenerator =
            serde_json::from_str(r#"{"label": "broker", "type": "password", "size": 32}"#).unwrap();
        assert_eq!(full.label(), "broker");
    }

    #[test]
    fn test_configuration_deserialize_defaults() {
        let config: ServiceConfiguration = serde_json::from_str(
            r#"{"name": "proxy", "image": "registry/proxy:2"}"#,
        )
        .unwrap();
        assert_eq!(config.name, "proxy");
        assert!(config.generators.is_empty());
        assert!(config.replicas.is_none());
        assert!(!config.web_only());
    }
}
