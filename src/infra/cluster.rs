//! 集群能力接口
//!
//! 编排器 API 的薄封装接口。核心逻辑只依赖这个 trait，生产环境由
//! docker CLI 实现，测试用内存假实现。
//!
//! 错误归一化约定：404/"not found" 归一为 `NotFound`（缺失，创建
//! 即可）；409/"already exists" 归一为 `Conflict`（已存在，按成功
//! 处理）；其他状态作为硬错误传播。

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// 集群错误
#[derive(Debug, Error)]
pub enum ClusterError {
    /// 对象不存在（归一为"缺失，创建它"）
    #[error("not found: {0}")]
    NotFound(String),

    /// 创建冲突（归一为"已存在，继续"）
    #[error("already exists: {0}")]
    Conflict(String),

    /// 编排器不可达
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// 镜像不存在（本地没有且无法拉取）
    #[error("unknown image: {0}")]
    UnknownImage(String),

    /// 其他命令失败
    #[error("cluster command failed: {0}")]
    CommandFailed(String),
}

/// 集群中一个服务的实时视图
#[derive(Clone, Debug, Default)]
pub struct ClusterService {
    pub name: String,
    pub image: Option<String>,
    /// 声明副本数；没有 Replicated 模式的服务为 None
    pub replicas: Option<u64>,
    /// 期望运行的任务中处于 running 状态的数量
    pub running_tasks: u64,
    /// 期望运行的任务中处于 preparing 状态的数量
    pub preparing_tasks: u64,
    pub labels: HashMap<String, String>,
    /// 容器 spec 引用的 config 对象名
    pub config_refs: Vec<String>,
    /// 容器 spec 引用的 secret 对象名
    pub secret_refs: Vec<String>,
}

impl ClusterService {
    /// 服务 spec 引用的全部 config/secret 对象名
    pub fn spec_refs(&self) -> Vec<String> {
        let mut refs = self.config_refs.clone();
        refs.extend(self.secret_refs.iter().cloned());
        refs
    }

    /// 是否有任务在运行
    pub fn is_running(&self) -> bool {
        self.running_tasks > 0
    }

    /// 是否有任务在准备中
    pub fn is_preparing(&self) -> bool {
        self.preparing_tasks > 0
    }
}

/// config/secret 对象的列表视图
#[derive(Clone, Debug)]
pub struct ClusterObject {
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// 创建服务时使用的完整解析后 spec
#[derive(Clone, Debug, Default)]
pub struct ResolvedServiceSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub mounts: Vec<String>,
    pub constraints: Vec<String>,
    pub labels: HashMap<String, String>,
    pub config_refs: Vec<String>,
    pub secret_refs: Vec<String>,
    pub replicas: u64,
    pub networks: Vec<String>,
}

/// 容器内命令执行结果
#[derive(Clone, Debug)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

/// 编排器能力接口
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// 列出服务，可按名称过滤
    async fn list_services(&self, name_filter: Option<&str>)
        -> Result<Vec<ClusterService>, ClusterError>;

    /// 创建服务
    async fn create_service(&self, spec: &ResolvedServiceSpec) -> Result<(), ClusterError>;

    /// 强制重启服务
    async fn restart_service(&self, name: &str) -> Result<(), ClusterError>;

    /// 调整副本数（start = 1, stop = 0）
    async fn scale_service(&self, name: &str, replicas: u64) -> Result<(), ClusterError>;

    /// 移除服务
    async fn remove_service(&self, name: &str) -> Result<(), ClusterError>;

    /// 只更新服务的 config/secret 引用，保持镜像不变
    async fn update_service_refs(
        &self,
        name: &str,
        config_refs: &[String],
        secret_refs: &[String],
    ) -> Result<(), ClusterError>;

    /// 列出 config 对象
    async fn list_configs(&self) -> Result<Vec<ClusterObject>, ClusterError>;

    /// 列出 secret 对象
    async fn list_secrets(&self) -> Result<Vec<ClusterObject>, ClusterError>;

    /// 创建 config 对象（不可变；重复创建不算错误，由调用方处理 Conflict）
    async fn create_config(
        &self,
        name: &str,
        data: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), ClusterError>;

    /// 创建 secret 对象
    async fn create_secret(
        &self,
        name: &str,
        data: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), ClusterError>;

    /// 移除 config 对象
    async fn remove_config(&self, name: &str) -> Result<(), ClusterError>;

    /// 移除 secret 对象
    async fn remove_secret(&self, name: &str) -> Result<(), ClusterError>;

    /// 镜像是否已在本地
    async fn image_present(&self, image: &str) -> Result<bool, ClusterError>;

    /// 拉取镜像，返回解析后的 tag
    async fn pull_image(&self, image: &str) -> Result<String, ClusterError>;

    /// 在服务的运行容器内执行命令
    async fn exec_in_service(
        &self,
        service: &str,
        command: &[&str],
    ) -> Result<ExecOutput, ClusterError>;

    /// 确保 swarm 已初始化、overlay 网络已存在（幂等）
    async fn ensure_swarm(&self, network: &str) -> Result<(), ClusterError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! 内存假集群，供单元测试使用

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeState {
        pub services: Vec<ClusterService>,
        pub configs: Vec<ClusterObject>,
        pub secrets: Vec<ClusterObject>,
        pub local_images: Vec<String>,
        pub pullable_images: Vec<String>,
        /// 调用记录（动作, 对象名）
        pub calls: Vec<(String, String)>,
    }

    /// 内存假实现
    #[derive(Default)]
    pub struct FakeClusterClient {
        pub state: Mutex<FakeState>,
    }

    impl FakeClusterClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_service(&self, service: ClusterService) {
            self.state.lock().unwrap().services.push(service);
        }

        pub fn add_pullable_image(&self, image: &str) {
            self.state.lock().unwrap().pullable_images.push(image.to_string());
        }

        pub fn calls(&self) -> Vec<(String, String)> {
            self.state.lock().unwrap().calls.clone()
        }

        fn record(&self, action: &str, name: &str) {
            self.state
                .lock()
                .unwrap()
                .calls
                .push((action.to_string(), name.to_string()));
        }
    }

    #[async_trait]
    impl ClusterClient for FakeClusterClient {
        async fn list_services(
            &self,
            name_filter: Option<&str>,
        ) -> Result<Vec<ClusterService>, ClusterError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .services
                .iter()
                .filter(|s| name_filter.map_or(true, |f| s.name == f))
                .cloned()
                .collect())
        }

        async fn create_service(&self, spec: &ResolvedServiceSpec) -> Result<(), ClusterError> {
            self.record("create_service", &spec.name);
            let mut state = self.state.lock().unwrap();
            if state.services.iter().any(|s| s.name == spec.name) {
                return Err(ClusterError::Conflict(spec.name.clone()));
            }
            state.services.push(ClusterService {
                name: spec.name.clone(),
                image: Some(spec.image.clone()),
                replicas: Some(spec.replicas),
                running_tasks: spec.replicas,
                preparing_tasks: 0,
                labels: spec.labels.clone(),
                config_refs: spec.config_refs.clone(),
                secret_refs: spec.secret_refs.clone(),
            });
            Ok(())
        }

        async fn restart_service(&self, name: &str) -> Result<(), ClusterError> {
            self.record("restart_service", name);
            let mut state = self.state.lock().unwrap();
            match state.services.iter_mut().find(|s| s.name == name) {
                Some(service) => {
                    service.running_tasks = service.replicas.unwrap_or(1);
                    Ok(())
                }
                None => Err(ClusterError::NotFound(name.to_string())),
            }
        }

        async fn scale_service(&self, name: &str, replicas: u64) -> Result<(), ClusterError> {
            self.record("scale_service", name);
            let mut state = self.state.lock().unwrap();
            match state.services.iter_mut().find(|s| s.name == name) {
                Some(service) => {
                    service.replicas = Some(replicas);
                    service.running_tasks = replicas;
                    Ok(())
                }
                None => Err(ClusterError::NotFound(name.to_string())),
            }
        }

        async fn remove_service(&self, name: &str) -> Result<(), ClusterError> {
            self.record("remove_service", name);
            let mut state = self.state.lock().unwrap();
            let before = state.services.len();
            state.services.retain(|s| s.name != name);
            if state.services.len() == before {
                return Err(ClusterError::NotFound(name.to_string()));
            }
            Ok(())
        }

        async fn update_service_refs(
            &self,
            name: &str,
            config_refs: &[String],
            secret_refs: &[String],
        ) -> Result<(), ClusterError> {
            self.record("update_service_refs", name);
            let mut state = self.state.lock().unwrap();
            match state.services.iter_mut().find(|s| s.name == name) {
                Some(service) => {
                    service.config_refs = config_refs.to_vec();
                    service.secret_refs = secret_refs.to_vec();
                    Ok(())
                }
                None => Err(ClusterError::NotFound(name.to_string())),
            }
        }

        async fn list_configs(&self) -> Result<Vec<ClusterObject>, ClusterError> {
            Ok(self.state.lock().unwrap().configs.clone())
        }

        async fn list_secrets(&self) -> Result<Vec<ClusterObject>, ClusterError> {
            Ok(self.state.lock().unwrap().secrets.clone())
        }

        async fn create_config(
            &self,
            name: &str,
            _data: &str,
            labels: &HashMap<String, String>,
        ) -> Result<(), ClusterError> {
            self.record("create_config", name);
            let mut state = self.state.lock().unwrap();
            if state.configs.iter().any(|c| c.name == name) {
                return Err(ClusterError::Conflict(name.to_string()));
            }
            state.configs.push(ClusterObject { name: name.to_string(), labels: labels.clone() });
            Ok(())
        }

        async fn create_secret(
            &self,
            name: &str,
            _data: &str,
            labels: &HashMap<String, String>,
        ) -> Result<(), ClusterError> {
            self.record("create_secret", name);
            let mut state = self.state.lock().unwrap();
            if state.secrets.iter().any(|s| s.name == name) {
                return Err(ClusterError::Conflict(name.to_string()));
            }
            state.secrets.push(ClusterObject { name: name.to_string(), labels: labels.clone() });
            Ok(())
        }

        async fn remove_config(&self, name: &str) -> Result<(), ClusterError> {
            self.record("remove_config", name);
            let mut state = self.state.lock().unwrap();
            let before = state.configs.len();
            state.configs.retain(|c| c.name != name);
            if state.configs.len() == before {
                return Err(ClusterError::NotFound(name.to_string()));
            }
            Ok(())
        }

        async fn remove_secret(&self, name: &str) -> Result<(), ClusterError> {
            self.record("remove_secret", name);
            let mut state = self.state.lock().unwrap();
            let before = state.secrets.len();
            state.secrets.retain(|s| s.name != name);
            if state.secrets.len() == before {
                return Err(ClusterError::NotFound(name.to_string()));
            }
            Ok(())
        }

        async fn image_present(&self, image: &str) -> Result<bool, ClusterError> {
            Ok(self.state.lock().unwrap().local_images.iter().any(|i| i == image))
        }

        async fn pull_image(&self, image: &str) -> Result<String, ClusterError> {
            self.record("pull_image", image);
            let mut state = self.state.lock().unwrap();
            if state.pullable_images.iter().any(|i| i == image) {
                state.local_images.push(image.to_string());
                Ok(image.to_string())
            } else {
                Err(ClusterError::UnknownImage(image.to_string()))
            }
        }

        async fn exec_in_service(
            &self,
            service: &str,
            _command: &[&str],
        ) -> Result<ExecOutput, ClusterError> {
            self.record("exec_in_service", service);
            Ok(ExecOutput { exit_code: 0, output: String::new() })
        }

        async fn ensure_swarm(&self, network: &str) -> Result<(), ClusterError> {
            self.record("ensure_swarm", network);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_refs_combines_configs_and_secrets() {
        let service = ClusterService {
            name: "broker".to_string(),
            config_refs: vec!["pki.broker.cert.20230601000000".to_string()],
            secret_refs: vec!["pki.broker.key.20230601000000".to_string()],
            ..Default::default()
        };
        assert_eq!(service.spec_refs().len(), 2);
    }
}
