//! ClusterClient 的 docker CLI 实现
//!
//! 通过 `docker` 命令行驱动 Swarm，JSON 输出用 serde_json 解析。
//! 所有错误按约定归一化：stderr 里的 not found / already exists
//! 分别映射为 NotFound / Conflict。

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::env::constants::{CLUSTER_COMMAND_TIMEOUT_SECS, IMAGE_PULL_TIMEOUT_SECS};
use crate::infra::cluster::{
    ClusterClient, ClusterError, ClusterObject, ClusterService, ExecOutput, ResolvedServiceSpec,
};
use crate::infra::command::{CommandError, CommandOutput, CommandRunner};

/// docker CLI 客户端
pub struct DockerCliClient {
    binary: String,
}

impl DockerCliClient {
    pub fn new() -> Self {
        Self { binary: "docker".to_string() }
    }

    fn command_timeout() -> Duration {
        Duration::from_secs(CLUSTER_COMMAND_TIMEOUT_SECS)
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput, ClusterError> {
        self.run_with(args, None, Self::command_timeout()).await
    }

    async fn run_with(
        &self,
        args: &[&str],
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, ClusterError> {
        CommandRunner::run_with_stdin(&self.binary, args, stdin, timeout)
            .await
            .map_err(map_command_error)
    }

    /// 运行命令并把非零退出码归一为 ClusterError
    async fn run_checked(&self, args: &[&str]) -> Result<CommandOutput, ClusterError> {
        let output = self.run(args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_stderr(&output.stderr))
        }
    }

    /// 检查 docker 守护进程是否可达
    pub async fn available(&self) -> bool {
        match self.run(&["version", "--format", "{{.Server.Version}}"]).await {
            Ok(output) => output.success(),
            Err(_) => false,
        }
    }

    async fn inspect_service(&self, name: &str) -> Result<ClusterService, ClusterError> {
        let inspect = self.run_checked(&["service", "inspect", name]).await?;
        let parsed: Value = serde_json::from_str(&inspect.stdout)
            .map_err(|e| ClusterError::CommandFailed(format!("inspect parse error: {}", e)))?;
        let entry = parsed
            .get(0)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;

        let spec = &entry["Spec"];
        let container_spec = &spec["TaskTemplate"]["ContainerSpec"];

        let image = container_spec["Image"]
            .as_str()
            .map(|i| i.split('@').next().unwrap_or(i).to_string());
        let replicas = spec["Mode"]["Replicated"]["Replicas"].as_u64();

        let mut labels = HashMap::new();
        if let Some(map) = spec["Labels"].as_object() {
            for (key, value) in map {
                if let Some(value) = value.as_str() {
                    labels.insert(key.clone(), value.to_string());
                }
            }
        }

        let config_refs = ref_names(&container_spec["Configs"], "ConfigName");
        let secret_refs = ref_names(&container_spec["Secrets"], "SecretName");

        let (running_tasks, preparing_tasks) = self.task_states(name).await?;

        Ok(ClusterService {
            name: name.to_string(),
            image,
            replicas,
            running_tasks,
            preparing_tasks,
            labels,
            config_refs,
            secret_refs,
        })
    }

    /// 统计期望运行的任务中 running/preparing 的数量
    async fn task_states(&self, name: &str) -> Result<(u64, u64), ClusterError> {
        let output = self
            .run_checked(&[
                "service",
                "ps",
                name,
                "--filter",
                "desired-state=running",
                "--format",
                "{{.CurrentState}}",
            ])
            .await?;

        let mut running = 0;
        let mut preparing = 0;
        for line in output.stdout.lines() {
            let state = line.trim().to_ascii_lowercase();
            if state.starts_with("running") {
                running += 1;
            } else if state.starts_with("preparing") || state.starts_with("starting") {
                preparing += 1;
            }
        }
        Ok((running, preparing))
    }

    async fn list_objects(&self, object_kind: &str) -> Result<Vec<ClusterObject>, ClusterError> {
        let output = self
            .run_checked(&[object_kind, "ls", "--format", "{{.Name}}"])
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|name| ClusterObject { name: name.to_string(), labels: HashMap::new() })
            .collect())
    }

    async fn create_object(
        &self,
        object_kind: &str,
        name: &str,
        data: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), ClusterError> {
        let mut args: Vec<String> = vec![object_kind.to_string(), "create".to_string()];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        args.push("-".to_string()); // 数据走 stdin，不进命令行
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self
            .run_with(&arg_refs, Some(data), Self::command_timeout())
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_stderr(&output.stderr))
        }
    }
}

impl Default for DockerCliClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for DockerCliClient {
    async fn list_services(
        &self,
        name_filter: Option<&str>,
    ) -> Result<Vec<ClusterService>, ClusterError> {
        let mut args = vec!["service", "ls", "--format", "{{.Name}}"];
        let filter;
        if let Some(name) = name_filter {
            filter = format!("name={}", name);
            args.push("--filter");
            args.push(&filter);
        }
        let output = self.run_checked(&args).await?;

        let mut services = Vec::new();
        for line in output.stdout.lines() {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            // --filter name= 是前缀匹配，显式过滤时要求完全一致
            if let Some(wanted) = name_filter {
                if name != wanted {
                    continue;
                }
            }
            match self.inspect_service(name).await {
                Ok(service) => services.push(service),
                Err(ClusterError::NotFound(_)) => continue, // 列表和 inspect 之间消失了
                Err(err) => return Err(err),
            }
        }
        Ok(services)
    }

    async fn create_service(&self, spec: &ResolvedServiceSpec) -> Result<(), ClusterError> {
        let mut args: Vec<String> = vec![
            "service".into(),
            "create".into(),
            "--detach".into(),
            "--name".into(),
            spec.name.clone(),
            "--replicas".into(),
            spec.replicas.to_string(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for env in &spec.env {
            args.push("--env".into());
            args.push(env.clone());
        }
        for mount in &spec.mounts {
            args.push("--mount".into());
            args.push(mount.clone());
        }
        for constraint in &spec.constraints {
            args.push("--constraint".into());
            args.push(constraint.clone());
        }
        for network in &spec.networks {
            args.push("--network".into());
            args.push(network.clone());
        }
        for config in &spec.config_refs {
            args.push("--config".into());
            args.push(config.clone());
        }
        for secret in &spec.secret_refs {
            args.push("--secret".into());
            args.push(secret.clone());
        }
        args.push(spec.image.clone());

        info!(service = %spec.name, image = %spec.image, "Creating service");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&arg_refs).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_stderr(&output.stderr))
        }
    }

    async fn restart_service(&self, name: &str) -> Result<(), ClusterError> {
        info!(service = %name, "Restarting service");
        self.run_checked(&["service", "update", "--detach", "--force", name])
            .await?;
        Ok(())
    }

    async fn scale_service(&self, name: &str, replicas: u64) -> Result<(), ClusterError> {
        let scale = format!("{}={}", name, replicas);
        self.run_checked(&["service", "scale", "--detach", &scale]).await?;
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> Result<(), ClusterError> {
        self.run_checked(&["service", "rm", name]).await?;
        Ok(())
    }

    async fn update_service_refs(
        &self,
        name: &str,
        config_refs: &[String],
        secret_refs: &[String],
    ) -> Result<(), ClusterError> {
        let current = self.inspect_service(name).await?;

        let mut args: Vec<String> =
            vec!["service".into(), "update".into(), "--detach".into()];
        for stale in current.config_refs.iter().filter(|r| !config_refs.contains(r)) {
            args.push("--config-rm".into());
            args.push(stale.clone());
        }
        for fresh in config_refs.iter().filter(|r| !current.config_refs.contains(r)) {
            args.push("--config-add".into());
            args.push(fresh.clone());
        }
        for stale in current.secret_refs.iter().filter(|r| !secret_refs.contains(r)) {
            args.push("--secret-rm".into());
            args.push(stale.clone());
        }
        for fresh in secret_refs.iter().filter(|r| !current.secret_refs.contains(r)) {
            args.push("--secret-add".into());
            args.push(fresh.clone());
        }

        if args.len() == 3 {
            debug!(service = %name, "Service references already current");
            return Ok(());
        }
        args.push(name.to_string());

        info!(service = %name, "Updating service credential references");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&arg_refs).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_stderr(&output.stderr))
        }
    }

    async fn list_configs(&self) -> Result<Vec<ClusterObject>, ClusterError> {
        self.list_objects("config").await
    }

    async fn list_secrets(&self) -> Result<Vec<ClusterObject>, ClusterError> {
        self.list_objects("secret").await
    }

    async fn create_config(
        &self,
        name: &str,
        data: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), ClusterError> {
        self.create_object("config", name, data, labels).await
    }

    async fn create_secret(
        &self,
        name: &str,
        data: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), ClusterError> {
        self.create_object("secret", name, data, labels).await
    }

    async fn remove_config(&self, name: &str) -> Result<(), ClusterError> {
        self.run_checked(&["config", "rm", name]).await?;
        Ok(())
    }

    async fn remove_secret(&self, name: &str) -> Result<(), ClusterError> {
        self.run_checked(&["secret", "rm", name]).await?;
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool, ClusterError> {
        let output = self.run(&["image", "inspect", image, "--format", "{{.Id}}"]).await?;
        Ok(output.success())
    }

    async fn pull_image(&self, image: &str) -> Result<String, ClusterError> {
        info!(image = %image, "Pulling image");
        let output = self
            .run_with(
                &["image", "pull", image],
                None,
                Duration::from_secs(IMAGE_PULL_TIMEOUT_SECS),
            )
            .await?;
        if output.success() {
            Ok(image.to_string())
        } else {
            warn!(image = %image, stderr = %output.stderr.trim(), "Image pull failed");
            Err(ClusterError::UnknownImage(image.to_string()))
        }
    }

    async fn exec_in_service(
        &self,
        service: &str,
        command: &[&str],
    ) -> Result<ExecOutput, ClusterError> {
        let filter = format!("name={}", service);
        let ps = self
            .run_checked(&["ps", "--filter", &filter, "--format", "{{.ID}}"])
            .await?;
        let container = ps
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| ClusterError::NotFound(format!("container for {}", service)))?
            .to_string();

        let mut args = vec!["exec", container.as_str()];
        args.extend_from_slice(command);
        let output = self.run(&args).await?;
        Ok(ExecOutput {
            exit_code: output.exit_code,
            output: format!("{}{}", output.stdout, output.stderr),
        })
    }

    async fn ensure_swarm(&self, network: &str) -> Result<(), ClusterError> {
        let init = self.run(&["swarm", "init"]).await?;
        if !init.success() {
            let stderr = init.stderr.to_ascii_lowercase();
            if stderr.contains("already part of a swarm") {
                debug!("Swarm already initialized");
            } else {
                return Err(classify_stderr(&init.stderr));
            }
        }

        let create = self
            .run(&["network", "create", "--driver", "overlay", "--attachable", network])
            .await?;
        if !create.success() {
            match classify_stderr(&create.stderr) {
                ClusterError::Conflict(_) => {
                    debug!(network = %network, "Overlay network already exists");
                }
                err => return Err(err),
            }
        }
        Ok(())
    }
}

fn map_command_error(err: CommandError) -> ClusterError {
    match err {
        CommandError::Timeout => ClusterError::Unavailable("command timed out".to_string()),
        other => ClusterError::Unavailable(other.to_string()),
    }
}

/// stderr 文本 -> 归一化错误
fn classify_stderr(stderr: &str) -> ClusterError {
    let lower = stderr.to_ascii_lowercase();
    let message = stderr.trim().to_string();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
    {
        ClusterError::Unavailable(message)
    } else if lower.contains("already exists")
        || lower.contains("name conflicts")
        || lower.contains("already in use")
    {
        ClusterError::Conflict(message)
    } else if lower.contains("not found")
        || lower.contains("no such service")
        || lower.contains("no such config")
        || lower.contains("no such secret")
        || lower.contains("no such image")
    {
        ClusterError::NotFound(message)
    } else {
        ClusterError::CommandFailed(message)
    }
}

fn ref_names(value: &Value, key: &str) -> Vec<String> {
    value
        .as_array()
        .map(|refs| {
            refs.iter()
                .filter_map(|r| r[key].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
