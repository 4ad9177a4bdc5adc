//! 模块目录加载
//!
//! 从配置目录读取 `docker.<name>.json` 模块描述、`app.<name>.json`
//! 应用描述和 `web_applications.json` 注册表。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::domain::service::ServiceConfiguration;
use crate::error::AgentError;

/// 已安装应用的描述文件内容
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppDescriptor {
    pub name: String,
    pub version: Option<String>,
    /// 应用包含的可部署单元
    #[serde(default)]
    pub dependencies: Vec<ServiceConfiguration>,
    /// 静态应用链接元数据（写入 web_applications.json）
    pub web: Option<serde_json::Value>,
    /// nginx 配置片段（由外部协作者消费）
    pub nginx: Option<serde_json::Value>,
}

impl AppDescriptor {
    /// 描述文件路径 `app.<name>.json`
    pub fn file_path(catalog_dir: &Path, name: &str) -> PathBuf {
        catalog_dir.join(format!("app.{}.json", name))
    }
}

/// 按必须模块列表加载模块配置
///
/// 缺失的模块文件记录错误并跳过（配置错误不阻塞其他模块）。
pub fn load_required_modules(
    catalog_dir: &Path,
    module_files: &[&str],
) -> Vec<ServiceConfiguration> {
    let mut configurations = Vec::new();
    for filename in module_files {
        let path = catalog_dir.join(filename);
        match load_service_configuration(&path) {
            Ok(config) => configurations.push(config),
            Err(err) => {
                error!(file = %path.display(), error = %err, "Missing or invalid module file");
            }
        }
    }
    configurations
}

/// 加载单个模块配置文件
pub fn load_service_configuration(path: &Path) -> Result<ServiceConfiguration, AgentError> {
    let content = fs::read_to_string(path)?;
    let config: ServiceConfiguration = serde_json::from_str(&content)?;
    Ok(config)
}

/// 加载所有已安装应用的依赖（app.*.json）
pub fn load_application_dependencies(catalog_dir: &Path) -> Vec<ServiceConfiguration> {
    let mut configurations = Vec::new();
    let entries = match fs::read_dir(catalog_dir) {
        Ok(entries) => entries,
        Err(_) => return configurations, // 还没有任何配置
    };

    for entry in entries.flatten() {
        let filename = entry.file_name().to_string_lossy().to_string();
        if !filename.starts_with("app.") || !filename.ends_with(".json") {
            continue;
        }
        match load_app_descriptor(&entry.path()) {
            Ok(descriptor) => configurations.extend(descriptor.dependencies),
            Err(err) => {
                error!(file = %entry.path().display(), error = %err, "Invalid application descriptor");
            }
        }
    }

    configurations
}

/// 加载单个应用描述文件
pub fn load_app_descriptor(path: &Path) -> Result<AppDescriptor, AgentError> {
    let content = fs::read_to_string(path)?;
    let descriptor: AppDescriptor = serde_json::from_str(&content)?;
    Ok(descriptor)
}

/// 写入应用描述文件，返回写入路径
pub fn save_app_descriptor(
    catalog_dir: &Path,
    descriptor: &AppDescriptor,
) -> Result<PathBuf, AgentError> {
    fs::create_dir_all(catalog_dir)?;
    let path = AppDescriptor::file_path(catalog_dir, &descriptor.name);
    let content = serde_json::to_string_pretty(descriptor)?;
    fs::write(&path, content)?;
    Ok(path)
}

/// 列出已安装应用（名称 + 版本），供在线上报使用
pub fn list_installed_applications(catalog_dir: &Path) -> Vec<(String, Option<String>)> {
    let mut applications = Vec::new();
    let entries = match fs::read_dir(catalog_dir) {
        Ok(entries) => entries,
        Err(_) => return applications,
    };
    for entry in entries.flatten() {
        let filename = entry.file_name().to_string_lossy().to_string();
        if !filename.starts_with("app.") || !filename.ends_with(".json") {
            continue;
        }
        if let Ok(descriptor) = load_app_descriptor(&entry.path()) {
            applications.push((descriptor.name, descriptor.version));
        }
    }
    applications.sort();
    applications
}

/// web_applications.json 注册表：位置 -> 已安装摘要与链接元数据
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WebApplicationsRegistry {
    #[serde(flatten)]
    pub entries: BTreeMap<String, WebApplicationEntry>,
}

/// 注册表单项
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebApplicationEntry {
    pub digest: String,
    pub links: Option<serde_json::Value>,
}

impl WebApplicationsRegistry {
    /// 注册表文件路径
    pub fn file_path(config_dir: &Path) -> PathBuf {
        config_dir.join("web_applications.json")
    }

    /// 读取注册表，文件缺失返回空表
    pub fn load(config_dir: &Path) -> Self {
        let path = Self::file_path(config_dir);
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// 保存注册表
    pub fn save(&self, config_dir: &Path) -> Result<(), AgentError> {
        fs::create_dir_all(config_dir)?;
        let path = Self::file_path(config_dir);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
