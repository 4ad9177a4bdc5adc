//! 命令执行器
//!
//! 提供统一的子进程执行接口，支持：
//! - 超时控制
//! - 取消支持
//! - stdin 数据注入（secret 内容不经过命令行参数）
//! - 实时日志转发到 tracing

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn command: {0}")]
    SpawnFailed(std::io::Error),

    #[error("command timed out")]
    Timeout,

    #[error("command was cancelled")]
    Cancelled,

    #[error("failed to wait for command: {0}")]
    WaitFailed(std::io::Error),
}

/// 捕获的命令输出
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl CommandRunner {
    /// 执行命令并捕获输出
    pub async fn run(
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        Self::run_with_stdin(program, args, None, timeout).await
    }

    /// 执行命令，可选地向 stdin 写入数据
    pub async fn run_with_stdin(
        program: &str,
        args: &[&str],
        stdin_data: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        debug!(program, ?args, "Running command");

        let mut command = Command::new(program);
        command
            .args(args)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if stdin_data.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn().map_err(CommandError::SpawnFailed)?;

        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                let data = data.to_string();
                // 写入失败说明子进程已退出，由 wait 的结果来报告
                let _ = stdin.write_all(data.as_bytes()).await;
                let _ = stdin.shutdown().await;
            }
        }

        let wait = async {
            let output = child
                .wait_with_output()
                .await
                .map_err(CommandError::WaitFailed)?;
            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                error!(program, "Command timed out after {:?}", timeout);
                Err(CommandError::Timeout)
            }
        }
    }

    /// 执行 shell 脚本并把输出逐行转发到 tracing
    ///
    /// 用于模块安装脚本：脚本可能运行较久，需要取消支持。
    pub async fn run_script(
        script: &str,
        work_dir: &Path,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<i32, CommandError> {
        let mut child = Command::new("sh")
            .args(["-c", script])
            .current_dir(work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(CommandError::SpawnFailed)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(stream = "stdout", "{}", line);
                }
            }
        });
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(stream = "stderr", "{}", line);
                }
            }
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Script cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                error!("Script timed out after {:?}", timeout);
                let _ = child.kill().await;
                Err(CommandError::Timeout)
            }
            status = child.wait() => {
                let status = status.map_err(CommandError::WaitFailed)?;
                Ok(status.code().unwrap_or(-1))
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        result
    }
}
