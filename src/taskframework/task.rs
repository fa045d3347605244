// 任务单元定义

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// 任务调度信息
///
/// `id` 在加入执行器时分配，从 1 开始递增，与执行顺序无关
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    id: u64,
    retry: u32,
    max_retry: u32,
}

impl TaskInfo {
    pub(crate) fn new(id: u64, max_retry: u32) -> Self {
        Self {
            id,
            retry: 0,
            max_retry,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 已重试次数
    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// 重试次数是否已用完
    pub fn retry_exhausted(&self) -> bool {
        self.retry >= self.max_retry
    }

    pub(crate) fn increase_retry(&mut self) {
        self.retry += 1;
    }
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.id)
    }
}

/// 一次运行的结果
#[derive(Debug)]
pub struct TaskUnitRunResult<E> {
    /// 是否成功
    pub succeed: bool,
    /// 失败时是否需要重试
    pub need_retry: bool,
    pub err: Option<E>,
}

impl<E> TaskUnitRunResult<E> {
    pub fn success() -> Self {
        Self {
            succeed: true,
            need_retry: false,
            err: None,
        }
    }

    /// 可重试的失败
    pub fn retryable(err: E) -> Self {
        Self {
            succeed: false,
            need_retry: true,
            err: Some(err),
        }
    }

    /// 不可重试的失败
    pub fn fatal(err: E) -> Self {
        Self {
            succeed: false,
            need_retry: false,
            err: Some(err),
        }
    }
}

/// 可被 [`TaskExecutor`](super::TaskExecutor) 调度的任务单元
///
/// 单元只负责执行一次并给出结果，是否重试由执行器决定
#[async_trait]
pub trait TaskUnit: Send + 'static {
    type Error: fmt::Display + Send + 'static;

    /// 执行一次
    async fn run(&mut self, info: &TaskInfo) -> TaskUnitRunResult<Self::Error>;

    /// 即将重新排队（`info.retry()` 已是新的重试次数）
    fn on_retry(&mut self, _info: &TaskInfo, _result: &TaskUnitRunResult<Self::Error>) {}

    fn on_success(&mut self, _info: &TaskInfo) {}

    /// 最终失败
    fn on_failed(&mut self, _info: &TaskInfo, _result: &TaskUnitRunResult<Self::Error>) {}

    /// 成功或最终失败后调用
    fn on_complete(&mut self, _info: &TaskInfo) {}

    /// 执行器停止时尚未开始的任务
    fn on_cancel(&mut self, _info: &TaskInfo) {}

    /// 重试前的等待时间，默认不等待
    fn retry_wait(&self) -> Duration {
        Duration::ZERO
    }
}

/// 执行器中的一项：调度信息 + 任务单元
pub struct TaskInfoItem<U: TaskUnit> {
    pub info: TaskInfo,
    pub unit: U,
    /// 最近一次失败的错误
    pub err: Option<U::Error>,
}

/// 运行中异常退出（panic）的任务，单元已随之丢失
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostTask {
    pub info: TaskInfo,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_info_retry() {
        let mut info = TaskInfo::new(7, 2);
        assert_eq!(info.id(), 7);
        assert!(!info.retry_exhausted());
        info.increase_retry();
        info.increase_retry();
        assert_eq!(info.retry(), 2);
        assert!(info.retry_exhausted());
        assert_eq!(info.to_string(), "[7]");

        assert!(TaskInfo::new(1, 0).retry_exhausted());
    }

    #[test]
    fn test_run_result_constructors() {
        let ok: TaskUnitRunResult<String> = TaskUnitRunResult::success();
        assert!(ok.succeed && ok.err.is_none());

        let r = TaskUnitRunResult::retryable("timeout".to_string());
        assert!(!r.succeed && r.need_retry);

        let f = TaskUnitRunResult::fatal("bad path".to_string());
        assert!(!f.succeed && !f.need_retry);
        assert_eq!(f.err.as_deref(), Some("bad path"));
    }
}
