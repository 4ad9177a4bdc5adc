//! 环境变量配置加载

use std::env;
use std::path::PathBuf;

/// 环境配置
///
/// 所有路径都从 data_dir 派生，允许环境变量单独覆盖。
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 数据根目录
    pub data_dir: PathBuf,
    /// 身份与模块配置目录
    pub config_dir: PathBuf,
    /// 模块目录（docker.*.json / app.*.json）
    pub catalog_dir: PathBuf,
    /// 密钥/证书/密码目录
    pub secrets_dir: PathBuf,
    /// Web 静态应用根目录
    pub web_root: PathBuf,
    /// 证书签发服务 URL
    pub issuer_url: String,
    /// Swarm overlay 网络名称
    pub swarm_network: String,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let data_dir = env::var("NODE_AGENT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/opt/node-agent"));
        Self::with_data_dir(data_dir)
    }

    /// 基于指定数据目录构造（测试与 --data-dir 覆盖共用）
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let config_dir = env::var("NODE_AGENT_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("configuration"));
        let catalog_dir = config_dir.join("docker");
        let secrets_dir = env::var("NODE_AGENT_SECRETS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("secrets"));
        let web_root = env::var("NODE_AGENT_WEB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("web"));

        let issuer_url = env::var("NODE_AGENT_ISSUER_URL")
            .unwrap_or_else(|_| "http://localhost:2080".to_string());

        let swarm_network =
            env::var("NODE_AGENT_SWARM_NETWORK").unwrap_or_else(|_| "node_net".to_string());

        Self {
            data_dir,
            config_dir,
            catalog_dir,
            secrets_dir,
            web_root,
            issuer_url,
            swarm_network,
        }
    }
}

/// 常量
pub mod constants {
    /// 重启看门狗扫描间隔（秒）
    pub const WATCHDOG_POLL_SECS: u64 = 5;

    /// 调和周期保底间隔（秒）- 即使没有任何触发也保证周期性调和
    pub const RECONCILE_CEILING_SECS: u64 = 900;

    /// 在线状态上报间隔（秒）
    pub const PRESENCE_INTERVAL_SECS: u64 = 20;

    /// 证书检查间隔（秒）
    pub const CERT_CHECK_INTERVAL_SECS: u64 = 1800;

    /// 安装管道下载/安装两级之间的队列深度
    pub const INSTALL_QUEUE_DEPTH: usize = 8;

    /// 等待服务就绪时的轮询间隔（秒）
    pub const SERVICE_WAIT_POLL_SECS: u64 = 5;

    /// 集群 CLI 命令超时（秒）
    pub const CLUSTER_COMMAND_TIMEOUT_SECS: u64 = 120;

    /// 镜像拉取超时（秒）
    pub const IMAGE_PULL_TIMEOUT_SECS: u64 = 900;

    /// 生成密码的随机字节数
    pub const PASSWORD_BYTES: usize = 24;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
