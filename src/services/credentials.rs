//! 版本化凭证存储
//!
//! 逻辑名（`pki.<module>`、`passwd.<label>`）到当前有效的带日期
//! config/secret 对象的映射。对象一旦创建不再修改，轮换时创建新
//! 对象并更新 current 指针；被取代的对象默认保留（审计痕迹），
//! 保留策略是显式可测试的选项。
//!
//! current 指针只在调和/续期路径中读改写，该路径按构造串行化
//! （同一时间只有一个调和周期）。

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::env::constants::PASSWORD_BYTES;
use crate::domain::credential::{CredentialKind, DatedObjectName};
use crate::error::AgentError;
use crate::infra::cluster::{ClusterClient, ClusterError};

/// 被取代凭证对象的保留策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialRetention {
    /// 保留旧对象（默认，保留审计痕迹）
    Keep,
    /// 轮换成功后删除旧对象
    PruneSuperseded,
}

/// 版本化凭证存储
pub struct CredentialStore {
    cluster: Arc<dyn ClusterClient>,
    secrets_dir: PathBuf,
    retention: CredentialRetention,
    /// pointer key（`<logical>.<kind>`）-> 当前对象
    current: RwLock<HashMap<String, DatedObjectName>>,
    /// pointer key -> 已发布材料的 sha256
    material_hashes: RwLock<HashMap<String, String>>,
}

impl CredentialStore {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        secrets_dir: PathBuf,
        retention: CredentialRetention,
    ) -> Self {
        Self {
            cluster,
            secrets_dir,
            retention,
            current: RwLock::new(HashMap::new()),
            material_hashes: RwLock::new(HashMap::new()),
        }
    }

    /// 从集群现有对象重建 current 指针（每个键保留最新时间戳）
    pub async fn refresh(&self) -> Result<(), AgentError> {
        let mut objects = self.cluster.list_configs().await?;
        objects.extend(self.cluster.list_secrets().await?);

        let mut latest: HashMap<String, DatedObjectName> = HashMap::new();
        for object in objects {
            let Some(parsed) = DatedObjectName::parse(&object.name) else {
                continue; // 非托管对象
            };
            let key = parsed.pointer_key();
            match latest.get(&key) {
                Some(existing) if existing.timestamp >= parsed.timestamp => {}
                _ => {
                    latest.insert(key, parsed);
                }
            }
        }

        debug!(entries = latest.len(), "Refreshed credential pointers");
        let mut current = self.current.write().await;
        *current = latest;
        Ok(())
    }

    /// 确保一个带日期对象存在并指向给定材料
    ///
    /// 已有对象名一致且材料哈希相同时不做任何事。创建遇到同名对象
    /// 按成功处理（幂等）。返回当前对象名。
    pub async fn ensure(
        &self,
        logical: &str,
        kind: CredentialKind,
        material: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<String, AgentError> {
        let name = DatedObjectName::build(logical, kind, issued_at);
        let key = name.pointer_key();
        let hash = material_hash(material);

        {
            let current = self.current.read().await;
            let hashes = self.material_hashes.read().await;
            if current.get(&key) == Some(&name) && hashes.get(&key) == Some(&hash) {
                return Ok(name.object_name());
            }
        }

        let object_name = name.object_name();
        let mut labels = HashMap::new();
        labels.insert("credential".to_string(), kind.as_str().to_string());
        labels.insert("label_prefix".to_string(), logical.to_string());
        labels.insert("date".to_string(), name.timestamp.clone());

        let result = if kind.is_secret() {
            self.cluster.create_secret(&object_name, material, &labels).await
        } else {
            self.cluster.create_config(&object_name, material, &labels).await
        };
        match result {
            Ok(()) => info!(object = %object_name, "Published dated credential"),
            Err(ClusterError::Conflict(_)) => {
                debug!(object = %object_name, "Dated credential already present");
            }
            Err(err) => return Err(err.into()),
        }

        let superseded = {
            let mut current = self.current.write().await;
            let previous = current.insert(key.clone(), name.clone());
            let mut hashes = self.material_hashes.write().await;
            hashes.insert(key, hash);
            previous.filter(|p| p.object_name() != object_name)
        };

        if self.retention == CredentialRetention::PruneSuperseded {
            if let Some(old) = superseded {
                self.prune(&old).await;
            }
        }

        Ok(object_name)
    }

    async fn prune(&self, old: &DatedObjectName) {
        let object_name = old.object_name();
        let result = if old.kind.is_secret() {
            self.cluster.remove_secret(&object_name).await
        } else {
            self.cluster.remove_config(&object_name).await
        };
        match result {
            Ok(()) => info!(object = %object_name, "Pruned superseded credential"),
            Err(ClusterError::NotFound(_)) => {}
            Err(err) => {
                // 删除失败只影响清理，不影响轮换本身
                debug!(object = %object_name, error = %err, "Failed to prune credential");
            }
        }
    }

    /// 确保标签对应的密码存在，返回 (密码, 对象名)
    ///
    /// 首次使用时生成并落盘；之后沿用文件内容，只有显式请求才轮换。
    /// 对象时间戳取密码文件的修改时间。
    pub async fn ensure_password(&self, label: &str) -> Result<(String, String), AgentError> {
        let logical = format!("passwd.{}", label);
        let path = self.secrets_dir.join(format!("{}.txt", logical));

        let password = match fs::read_to_string(&path) {
            Ok(content) => content.trim().to_string(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let password = generate_password();
                fs::create_dir_all(&self.secrets_dir)?;
                fs::write(&path, &password)?;
                info!(label = %label, "Generated new password");
                password
            }
            Err(err) => return Err(err.into()),
        };

        let modified: DateTime<Utc> = fs::metadata(&path)?.modified()?.into();
        let object_name =
            self.ensure(&logical, CredentialKind::Password, &password, modified).await?;
        Ok((password, object_name))
    }

    /// 显式轮换一个密码：删除本地文件后重新生成
    pub async fn rotate_password(&self, label: &str) -> Result<(String, String), AgentError> {
        let path = self.secrets_dir.join(format!("passwd.{}.txt", label));
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.ensure_password(label).await
    }

    /// 查询一个逻辑名+种类的当前对象名
    pub async fn current_object(&self, logical: &str, kind: CredentialKind) -> Option<String> {
        let key = format!("{}.{}", logical, kind.as_str());
        self.current.read().await.get(&key).map(|n| n.object_name())
    }

    /// 判断服务 spec 引用的对象是否全部为 current
    ///
    /// 任何一个可识别引用与记录的 current 不一致即视为过期。
    /// 无法识别的名称被忽略（向前兼容）；没有记录的逻辑名也被忽略。
    pub async fn is_current(&self, spec_refs: &[String]) -> bool {
        let current = self.current.read().await;
        for reference in spec_refs {
            let Some(parsed) = DatedObjectName::parse(reference) else {
                continue;
            };
            if let Some(recorded) = current.get(&parsed.pointer_key()) {
                if recorded != &parsed {
                    return false;
                }
            }
        }
        true
    }

    /// 服务应引用的当前 config/secret 对象名
    ///
    /// 返回 (config 引用, secret 引用)：`pki.<service>` 的证书与
    /// 私钥，以及声明的每个密码生成器的 secret。
    pub async fn current_refs_for(
        &self,
        service: &str,
        password_labels: &[String],
    ) -> (Vec<String>, Vec<String>) {
        let current = self.current.read().await;
        let mut config_refs = Vec::new();
        let mut secret_refs = Vec::new();

        let pki = format!("pki.{}", service);
        if let Some(cert) = current.get(&format!("{}.cert", pki)) {
            config_refs.push(cert.object_name());
        }
        if let Some(key) = current.get(&format!("{}.key", pki)) {
            secret_refs.push(key.object_name());
        }
        for label in password_labels {
            let key = format!("passwd.{}.password", label);
            if let Some(password) = current.get(&key) {
                secret_refs.push(password.object_name());
            }
        }

        (config_refs, secret_refs)
    }
}

fn material_hash(material: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 生成随机密码（24 字节，base64 URL-safe 无填充）
fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
