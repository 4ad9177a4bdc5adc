//! 应用管理
//!
//! 总线命令背后的应用生命周期：安装、升级、删除、启动、停止。
//! 应用配置持久化为 `app.<name>.json`；纯 web 应用的资源包按摘要
//! 判断是否需要重新安装，记录在 `web_applications.json`。

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::catalog::{
    self, AppDescriptor, WebApplicationEntry, WebApplicationsRegistry,
};
use crate::domain::service::{ActionKind, PlannedAction, ServiceConfiguration, ServiceStatus};
use crate::error::AgentError;
use crate::infra::cluster::{ClusterClient, ClusterError};
use crate::infra::command::CommandRunner;
use crate::services::certificates::CertificateLifecycle;
use crate::services::install::InstallPipeline;
use crate::state::AgentContext;

/// 命令执行结果（总线应答载荷）
#[derive(Clone, Debug, Serialize)]
pub struct CommandResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self { ok: true, err: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { ok: false, err: Some(message.into()) }
    }
}

/// 应用管理器
pub struct ApplicationsHandler {
    context: Arc<AgentContext>,
    cluster: Arc<dyn ClusterClient>,
    lifecycle: Arc<CertificateLifecycle>,
    pipeline: Arc<InstallPipeline>,
}

impl ApplicationsHandler {
    pub fn new(
        context: Arc<AgentContext>,
        cluster: Arc<dyn ClusterClient>,
        lifecycle: Arc<CertificateLifecycle>,
        pipeline: Arc<InstallPipeline>,
    ) -> Self {
        Self { context, cluster, lifecycle, pipeline }
    }

    /// 安装一个应用
    ///
    /// 保存描述文件，准备依赖的证书与密码，然后按依赖顺序安装服务。
    /// 已安装且未要求重装时拒绝。
    pub async fn install_application(
        &self,
        descriptor: AppDescriptor,
        reinstall: bool,
    ) -> Result<CommandResult, AgentError> {
        let name = descriptor.name.clone();
        info!(application = %name, reinstall, "Installing application");

        if !reinstall {
            let existing = self.cluster.list_services(Some(&name)).await?;
            if !existing.is_empty() {
                return Ok(CommandResult::err("application already installed"));
            }
        }

        for dependency in &descriptor.dependencies {
            if let Err(err) = dependency.validate() {
                return Ok(CommandResult::err(err.to_string()));
            }
        }

        catalog::save_app_descriptor(&self.context.config.catalog_dir, &descriptor)?;

        // 准备凭证：声明了证书的依赖生成 pki.<module>，生成器生成密码
        for dependency in &descriptor.dependencies {
            if let Err(err) = self.lifecycle.prepare_service_credentials(dependency).await {
                // 凭证错误只影响该依赖的安装
                error!(
                    application = %name,
                    service = %dependency.name,
                    error = %err,
                    "Failed to prepare credentials"
                );
                return Ok(CommandResult::err(format!(
                    "credentials for {}: {}",
                    dependency.name, err
                )));
            }
        }

        let plan: Vec<PlannedAction> = descriptor
            .dependencies
            .iter()
            .map(|config| PlannedAction {
                kind: ActionKind::Install,
                status: ServiceStatus::new(config.clone()),
            })
            .collect();
        self.pipeline.run_cycle(plan).await?;

        self.context.trigger_reconcile();
        Ok(CommandResult::ok())
    }

    /// 升级一个应用
    ///
    /// 先预拉取全部镜像，缺任何一个镜像直接拒绝，然后按重装路径安装。
    pub async fn upgrade_application(
        &self,
        descriptor: AppDescriptor,
    ) -> Result<CommandResult, AgentError> {
        let name = descriptor.name.clone();
        info!(application = %name, "Upgrading application");

        let images: Vec<String> = descriptor
            .dependencies
            .iter()
            .filter_map(|d| d.image.clone())
            .collect();
        for image in &images {
            if self.cluster.image_present(image).await? {
                continue;
            }
            if let Err(err) = self.cluster.pull_image(image).await {
                warn!(application = %name, image = %image, error = %err, "Upgrade image missing");
                return Ok(CommandResult::err(format!("image missing: {}", image)));
            }
        }

        self.install_application(descriptor, true).await
    }

    /// 删除一个应用：移除服务、描述文件和 web 注册表条目
    ///
    /// 所有"已不存在"的情况都按成功处理。
    pub async fn remove_application(&self, name: &str) -> Result<CommandResult, AgentError> {
        info!(application = %name, "Removing application");

        let descriptor_path =
            AppDescriptor::file_path(&self.context.config.catalog_dir, name);
        let service_names: Vec<String> = match catalog::load_app_descriptor(&descriptor_path) {
            Ok(descriptor) => {
                descriptor.dependencies.iter().map(|d| d.name.clone()).collect()
            }
            Err(_) => vec![name.to_string()], // 描述文件已删，按应用名处理
        };

        for service in &service_names {
            match self.cluster.remove_service(service).await {
                Ok(()) | Err(ClusterError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
            self.context.app_status.remove(service);
        }

        match fs::remove_file(&descriptor_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut registry = WebApplicationsRegistry::load(&self.context.config.config_dir);
        let before = registry.entries.len();
        registry.entries.retain(|_, entry| {
            entry.links.as_ref().and_then(|l| l.get("application")).and_then(|a| a.as_str())
                != Some(name)
        });
        if registry.entries.len() != before {
            registry.save(&self.context.config.config_dir)?;
        }

        Ok(CommandResult::ok())
    }

    /// 启动应用（副本数 1）
    pub async fn start_application(&self, name: &str) -> Result<CommandResult, AgentError> {
        match self.cluster.scale_service(name, 1).await {
            Ok(()) => Ok(CommandResult::ok()),
            Err(ClusterError::NotFound(_)) => {
                Ok(CommandResult::err("application not installed"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 停止应用（副本数 0，之后视为人工停用）
    pub async fn stop_application(&self, name: &str) -> Result<CommandResult, AgentError> {
        match self.cluster.scale_service(name, 0).await {
            Ok(()) => Ok(CommandResult::ok()),
            Err(ClusterError::NotFound(_)) => {
                Ok(CommandResult::err("application not installed"))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// 安装服务声明的静态资源包
///
/// 摘要与注册表一致的资源包跳过；否则下载、校验 sha256、写入
/// web 根目录，然后执行声明的安装脚本。
pub async fn install_web_archives(
    context: &AgentContext,
    config: &ServiceConfiguration,
) -> Result<(), AgentError> {
    let mut registry = WebApplicationsRegistry::load(&context.config.config_dir);

    for archive in &config.archives {
        if !archive_stale(&registry, &archive.location, &archive.digest) {
            debug!(service = %config.name, archive = %archive.location, "Archive up to date");
            continue;
        }

        info!(service = %config.name, archive = %archive.location, "Installing web archive");
        let bytes = download_archive(&archive.location).await?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = format!("{:x}", hasher.finalize());
        if digest != archive.digest {
            return Err(AgentError::credential(format!(
                "archive digest mismatch for {}: expected {}, got {}",
                archive.location, archive.digest, digest
            )));
        }

        let app_dir = context.config.web_root.join(&config.name);
        fs::create_dir_all(&app_dir)?;
        let filename = archive
            .location
            .rsplit('/')
            .next()
            .filter(|f| !f.is_empty())
            .unwrap_or("bundle");
        fs::write(app_dir.join(filename), &bytes)?;

        // 解包等后续处理交给模块自己声明的安装脚本
        for script in &config.install_scripts {
            let code = CommandRunner::run_script(
                script,
                &app_dir,
                context.stop_token(),
                Duration::from_secs(600),
            )
            .await
            .map_err(|e| AgentError::configuration(format!("install script: {}", e)))?;
            if code != 0 {
                return Err(AgentError::configuration(format!(
                    "install script exited with {}",
                    code
                )));
            }
        }

        registry.entries.insert(
            archive.location.clone(),
            WebApplicationEntry {
                digest: archive.digest.clone(),
                links: Some(serde_json::json!({ "application": config.name })),
            },
        );
        registry.save(&context.config.config_dir)?;
    }

    Ok(())
}

/// 注册表里没有该位置、或摘要不一致即视为需要重装
fn archive_stale(registry: &WebApplicationsRegistry, location: &str, digest: &str) -> bool {
    match registry.entries.get(location) {
        Some(entry) => entry.digest != digest,
        None => true,
    }
}

async fn download_archive(location: &str) -> Result<Vec<u8>, AgentError> {
    let response = reqwest::get(location)
        .await
        .map_err(|e| AgentError::configuration(format!("archive download: {}", e)))?;
    if !response.status().is_success() {
        return Err(AgentError::configuration(format!(
            "archive download: {} returned {}",
            location,
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| AgentError::configuration(format!("archive download: {}", e)))?;
    Ok(bytes.to_vec())
}
