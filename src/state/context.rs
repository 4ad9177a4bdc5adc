//! Agent 上下文
//!
//! 显式上下文对象，构造时传给每个组件（取代全局可变单例）。
//! 持有身份/配置快照并提供 reload 操作，reload 后按注册顺序
//! 通知监听器（监听器是显式列表里的普通函数引用）。

use std::fs;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::EnvConfig;
use crate::domain::runlevel::Runlevel;
use crate::domain::security::SecurityLevel;
use crate::error::AgentError;
use crate::state::app_status::ApplicationStatusStore;

/// 节点身份快照
#[derive(Clone, Debug)]
pub struct IdentitySnapshot {
    pub node_id: String,
    /// 未配置表示安装模式
    pub security: Option<SecurityLevel>,
    /// 所属平台网络标识
    pub network_id: Option<String>,
    pub hostname: String,
    pub ip_address: Option<String>,
}

/// 配置变化监听器
pub type ReloadListener = Box<dyn Fn(&IdentitySnapshot) + Send + Sync>;

/// Agent 上下文
pub struct AgentContext {
    pub config: EnvConfig,
    identity: RwLock<IdentitySnapshot>,
    listeners: Mutex<Vec<ReloadListener>>,
    stop: CancellationToken,
    runlevel_tx: watch::Sender<Runlevel>,
    reconcile: Notify,
    pub app_status: ApplicationStatusStore,
}

impl AgentContext {
    /// 创建上下文并加载初始身份
    ///
    /// 节点 id 不存在时生成并写入（幂等引导）。
    pub fn new(config: EnvConfig) -> Result<Self, AgentError> {
        fs::create_dir_all(&config.config_dir)?;
        fs::create_dir_all(&config.catalog_dir)?;
        fs::create_dir_all(&config.secrets_dir)?;

        let node_id_path = config.config_dir.join("node.id");
        if !node_id_path.exists() {
            let node_id = Uuid::new_v4().to_string();
            fs::write(&node_id_path, &node_id)?;
            info!(node_id = %node_id, "Generated new node id");
        }

        let identity = load_identity(&config)?;
        let (runlevel_tx, _) = watch::channel(Runlevel::Init);

        Ok(Self {
            config,
            identity: RwLock::new(identity),
            listeners: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
            runlevel_tx,
            reconcile: Notify::new(),
            app_status: ApplicationStatusStore::new(),
        })
    }

    /// 当前身份快照
    pub fn identity(&self) -> IdentitySnapshot {
        self.identity.read().unwrap().clone()
    }

    /// 重新加载身份配置并通知监听器
    pub fn reload(&self) -> Result<IdentitySnapshot, AgentError> {
        info!("Reloading node configuration");
        let identity = load_identity(&self.config)?;
        {
            let mut guard = self.identity.write().unwrap();
            *guard = identity.clone();
        }
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(&identity);
        }
        Ok(identity)
    }

    /// 注册配置变化监听器
    pub fn add_reload_listener(&self, listener: ReloadListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// 当前 runlevel
    pub fn runlevel(&self) -> Runlevel {
        *self.runlevel_tx.borrow()
    }

    /// 设置 runlevel（watch 通道天然合并转换期间的重复请求）
    pub fn set_runlevel(&self, level: Runlevel) {
        self.runlevel_tx.send_if_modified(|current| {
            if *current != level {
                *current = level;
                true
            } else {
                false
            }
        });
    }

    /// 订阅 runlevel 变化
    pub fn subscribe_runlevel(&self) -> watch::Receiver<Runlevel> {
        self.runlevel_tx.subscribe()
    }

    /// 触发一次调和
    pub fn trigger_reconcile(&self) {
        self.reconcile.notify_one();
    }

    /// 等待调和触发
    pub async fn reconcile_triggered(&self) {
        self.reconcile.notified().await;
    }

    /// 进程级停止令牌
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// 触发优雅停止
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// 是否正在停止
    pub fn stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// 可取消的休眠，返回 false 表示收到停止信号
    pub async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// 从磁盘读取身份文件
fn load_identity(config: &EnvConfig) -> Result<IdentitySnapshot, AgentError> {
    let node_id = read_value(&config.config_dir.join("node.id"))?
        .ok_or_else(|| AgentError::configuration("node.id missing"))?;

    let security = match read_value(&config.config_dir.join("node.security"))? {
        Some(raw) => Some(raw.parse::<SecurityLevel>().map_err(AgentError::Configuration)?),
        None => None,
    };
    let network_id = read_value(&config.config_dir.join("node.network"))?;

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    let ip_address = detect_ip_address();

    Ok(IdentitySnapshot { node_id, security, network_id, hostname, ip_address })
}

fn read_value(path: &Path) -> Result<Option<String>, AgentError> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim().to_string();
            Ok(if trimmed.is_empty() { None } else { Some(trimmed) })
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// 通过 UDP connect 探测本机出口地址（不发送任何数据包）
fn detect_ip_address() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("10.254.254.254:1").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}
