//! Certificate lifecycle
//!
//! Issues and renews the node's own certificate and per-module
//! certificates through the issuer capability, then publishes them into
//! the versioned credential store (cert as config, key as secret, both
//! stamped with the certificate's not-before time).
//!
//! The PEM material itself stays opaque: validity windows live in a JSON
//! sidecar written next to the key/cert files, so no certificate parsing
//! happens here.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::catalog;
use crate::config::env::constants::CERT_CHECK_INTERVAL_SECS;
use crate::domain::credential::CredentialKind;
use crate::domain::service::{CertificateRequest, ServiceConfiguration};
use crate::error::AgentError;
use crate::infra::issuer::{CertificateIssuer, KeyCert};
use crate::services::credentials::CredentialStore;
use crate::state::AgentContext;

/// 节点自身证书的模块名
pub const NODE_MODULE: &str = "node";

/// 证书生命周期管理
pub struct CertificateLifecycle {
    context: Arc<AgentContext>,
    issuer: Arc<dyn CertificateIssuer>,
    store: Arc<CredentialStore>,
}

impl CertificateLifecycle {
    pub fn new(
        context: Arc<AgentContext>,
        issuer: Arc<dyn CertificateIssuer>,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self { context, issuer, store }
    }

    fn paths(&self, module: &str) -> (PathBuf, PathBuf, PathBuf) {
        let secrets = &self.context.config.secrets_dir;
        (
            secrets.join(format!("pki.{}.cert", module)),
            secrets.join(format!("pki.{}.key", module)),
            secrets.join(format!("pki.{}.meta.json", module)),
        )
    }

    /// 从磁盘加载一个模块的密钥与证书，缺失返回 None
    pub fn load_keycert(&self, module: &str) -> Result<Option<KeyCert>, AgentError> {
        let (cert_path, key_path, meta_path) = self.paths(module);
        let meta = match fs::read_to_string(&meta_path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut keycert: KeyCert = serde_json::from_str(&meta)?;
        keycert.certificate_pem = match fs::read_to_string(&cert_path) {
            Ok(pem) => pem,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        keycert.key_pem = match fs::read_to_string(&key_path) {
            Ok(pem) => pem,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(keycert))
    }

    fn save_keycert(&self, module: &str, keycert: &KeyCert) -> Result<(), AgentError> {
        fs::create_dir_all(&self.context.config.secrets_dir)?;
        let (cert_path, key_path, meta_path) = self.paths(module);
        fs::write(&cert_path, &keycert.certificate_pem)?;
        fs::write(&key_path, &keycert.key_pem)?;
        // sidecar 只存有效期窗口，PEM 字段置空
        let meta = KeyCert {
            certificate_pem: String::new(),
            key_pem: String::new(),
            not_before: keycert.not_before,
            not_after: keycert.not_after,
        };
        fs::write(&meta_path, serde_json::to_string(&meta)?)?;
        Ok(())
    }

    /// 节点自身证书是否缺失或已过期（runlevel 计算输入）
    pub fn node_certificate_expired(&self) -> bool {
        match self.load_keycert(NODE_MODULE) {
            Ok(Some(keycert)) => keycert.is_expired(Utc::now()),
            Ok(None) => true,
            Err(err) => {
                error!(error = %err, "Failed to load node certificate, treating as expired");
                true
            }
        }
    }

    /// 确保节点自身证书有效，必要时续期
    pub async fn ensure_node_certificate(&self) -> Result<(), AgentError> {
        let now = Utc::now();
        let keycert = match self.load_keycert(NODE_MODULE)? {
            Some(keycert) if !keycert.is_expired(now) && !keycert.needs_renewal(now) => keycert,
            _ => {
                let identity = self.context.identity();
                info!("Renewing node certificate");
                let issued = self
                    .issuer
                    .issue_node(&identity.node_id, &[identity.hostname.clone()])
                    .await?;
                self.save_keycert(NODE_MODULE, &issued)?;
                issued
            }
        };

        self.publish(NODE_MODULE, &keycert, false).await
    }

    /// 确保一个模块的证书有效并已发布
    ///
    /// 密钥/证书不匹配等签发错误只影响该模块。
    pub async fn ensure_module_certificate(
        &self,
        module: &str,
        request: &CertificateRequest,
    ) -> Result<KeyCert, AgentError> {
        let now = Utc::now();
        let keycert = match self.load_keycert(module)? {
            Some(keycert) if !keycert.is_expired(now) && !keycert.needs_renewal(now) => keycert,
            _ => {
                let identity = self.context.identity();
                let mut hostnames = vec![identity.hostname.clone()];
                if let Some(dns) = &request.dns {
                    if let Some(extra) = dns.get("hostnames").and_then(|h| h.as_array()) {
                        hostnames
                            .extend(extra.iter().filter_map(|h| h.as_str().map(str::to_string)));
                    }
                }
                info!(module = %module, "Issuing module certificate");
                let issued = self
                    .issuer
                    .issue_module(&identity.node_id, module, request, &hostnames)
                    .await?;
                self.save_keycert(module, &issued)?;
                issued
            }
        };

        self.publish(module, &keycert, request.combine_keycert).await?;
        Ok(keycert)
    }

    /// 把证书（config）和私钥（secret）发布到凭证存储
    async fn publish(
        &self,
        module: &str,
        keycert: &KeyCert,
        combine: bool,
    ) -> Result<(), AgentError> {
        let logical = format!("pki.{}", module);
        self.store
            .ensure(&logical, CredentialKind::Cert, &keycert.certificate_pem, keycert.not_before)
            .await?;
        let key_material =
            if combine { keycert.combined_pem() } else { keycert.key_pem.clone() };
        self.store
            .ensure(&logical, CredentialKind::Key, &key_material, keycert.not_before)
            .await?;
        Ok(())
    }

    /// 准备一个服务声明的全部凭证（证书 + 密码）
    pub async fn prepare_service_credentials(
        &self,
        config: &ServiceConfiguration,
    ) -> Result<(), AgentError> {
        if let Some(request) = &config.certificate {
            self.ensure_module_certificate(&config.name, request).await?;
        }
        for generator in &config.generators {
            self.store.ensure_password(generator.label()).await?;
        }
        Ok(())
    }

    /// 续期所有进入过期窗口的证书并补齐密码
    ///
    /// 单个模块的失败只记录，不阻塞其他模块。
    pub async fn renew_due(&self, configs: &[ServiceConfiguration]) -> Result<(), AgentError> {
        self.ensure_node_certificate().await?;
        for config in configs {
            if let Err(err) = self.prepare_service_credentials(config).await {
                error!(module = %config.name, error = %err, "Certificate maintenance failed");
            }
        }
        Ok(())
    }

    /// 周期性证书维护
    pub async fn maintenance_loop(self: Arc<Self>) -> Result<(), AgentError> {
        loop {
            if !self.context.wait(Duration::from_secs(CERT_CHECK_INTERVAL_SECS)).await {
                debug!("Certificate maintenance loop stopped");
                return Ok(());
            }
            let required = self.context.app_status.required_modules();
            let module_files: Vec<&str> = required.iter().map(String::as_str).collect();
            let configs = catalog::load_required_modules(
                &self.context.config.catalog_dir,
                &module_files,
            );
            if let Err(err) = self.renew_due(&configs).await {
                error!(error = %err, "Certificate maintenance cycle failed");
            }
        }
    }
}
