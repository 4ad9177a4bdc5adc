//! 结构化任务组
//!
//! 父范围生成子任务，父任务只有在全部子任务结束后才完成；任何
//! 子任务出现未处理错误或 panic 时取消整个组（fail-fast），
//! 调用方把这个错误转换为进程终止。

use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{AgentError, AgentResult};

/// 任务组
pub struct TaskGroup {
    set: JoinSet<(String, AgentResult<()>)>,
    cancel: CancellationToken,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { set: JoinSet::new(), cancel }
    }

    /// 生成一个命名子任务
    pub fn spawn<F>(&mut self, name: &str, future: F)
    where
        F: Future<Output = AgentResult<()>> + Send + 'static,
    {
        let name = name.to_string();
        self.set.spawn(async move {
            let result = future.await;
            (name, result)
        });
    }

    /// 等待全部子任务结束
    ///
    /// 第一个失败的子任务触发组取消并中止其余任务，错误向上传播。
    /// 子任务在收到停止信号后应以 Ok 返回。
    pub async fn run(mut self) -> AgentResult<()> {
        let mut failure: Option<AgentError> = None;

        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(task = %name, "Task finished");
                }
                Ok((name, Err(err))) => {
                    error!(task = %name, error = %err, "Task failed, cancelling group");
                    failure = Some(AgentError::Task(format!("{}: {}", name, err)));
                    break;
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        continue;
                    }
                    error!(error = %join_err, "Task panicked, cancelling group");
                    failure = Some(AgentError::Task(format!("panic: {}", join_err)));
                    break;
                }
            }
        }

        if let Some(err) = failure {
            self.cancel.cancel();
            self.set.abort_all();
            while self.set.join_next().await.is_some() {}
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_group_completes_when_all_children_do() {
        let cancel = CancellationToken::new();
        let mut group = TaskGroup::new(cancel.clone());
        group.spawn("a", async { Ok(()) });
        group.spawn("b", async { Ok(()) });
        assert!(group.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_first_failure_cancels_group() {
        let cancel = CancellationToken::new();
        let observed = Arc::new(AtomicBool::new(false));

        let mut group = TaskGroup::new(cancel.clone());
        let child_cancel = cancel.clone();
        let child_observed = observed.clone();
        group.spawn("long", async move {
            child_cancel.cancelled().await;
            child_observed.store(true, Ordering::SeqCst);
            Ok(())
        });
        group.spawn("failing", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(AgentError::configuration("boom"))
        });

        let result = group.run().await;
        assert!(matches!(result, Err(AgentError::Task(_))));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_panic_escalates() {
        let cancel = CancellationToken::new();
        let mut group = TaskGroup::new(cancel.clone());
        group.spawn("panicking", async {
            panic!("unexpected");
            #[allow(unreachable_code)]
            Ok(())
        });
        let result = group.run().await;
        assert!(matches!(result, Err(AgentError::Task(_))));
    }
}
