// 任务执行器
//
// - 最多 `parallel` 个任务同时运行
// - 失败且可重试的任务重新排到队尾，与新任务共用同一并发上限
// - 重试次数用完的任务进入失败队列，按最终失败的先后顺序排列
// - 停止后不再调度新任务，已开始的任务继续运行到结束
// - 运行中 panic 的任务记入异常队列，不会从结果中消失

use std::collections::VecDeque;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::task::{LostTask, TaskInfo, TaskInfoItem, TaskUnit, TaskUnitRunResult};

type Finished<U> = Result<(TaskInfo, U, TaskUnitRunResult<<U as TaskUnit>::Error>), LostTask>;

/// 有界并发的任务执行器
pub struct TaskExecutor<U: TaskUnit> {
    parallel: usize,
    queue: VecDeque<TaskInfoItem<U>>,
    failed: VecDeque<TaskInfoItem<U>>,
    cancelled: VecDeque<TaskInfoItem<U>>,
    lost: VecDeque<LostTask>,
    /// 已加入的任务数量（也是最后分配的 id）
    appended: u64,
    succeeded: usize,
    retry_total: usize,
    stop_token: CancellationToken,
}

impl<U: TaskUnit> Default for TaskExecutor<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U: TaskUnit> TaskExecutor<U> {
    pub fn new() -> Self {
        Self {
            parallel: 1,
            queue: VecDeque::new(),
            failed: VecDeque::new(),
            cancelled: VecDeque::new(),
            lost: VecDeque::new(),
            appended: 0,
            succeeded: 0,
            retry_total: 0,
            stop_token: CancellationToken::new(),
        }
    }

    /// 使用外部的停止令牌
    pub fn with_stop_token(stop_token: CancellationToken) -> Self {
        Self {
            stop_token,
            ..Self::new()
        }
    }

    /// 设置最大并发数（至少为 1）
    pub fn set_parallel(&mut self, parallel: usize) {
        self.parallel = parallel.max(1);
    }

    pub fn parallel(&self) -> usize {
        self.parallel
    }

    /// 加入任务，返回分配的调度信息
    pub fn append(&mut self, unit: U, max_retry: u32) -> TaskInfo {
        self.appended += 1;
        let info = TaskInfo::new(self.appended, max_retry);
        self.queue.push_back(TaskInfoItem {
            info,
            unit,
            err: None,
        });
        info
    }

    /// 已加入的任务总数
    pub fn count(&self) -> usize {
        self.appended as usize
    }

    /// 停止句柄：取消后不再调度新任务
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop_token.clone()
    }

    /// 执行全部任务直到结束
    pub async fn execute(&mut self) {
        info!(
            "开始执行任务: 共 {} 个, 并发数 {}",
            self.queue.len(),
            self.parallel
        );

        let mut running: JoinSet<Finished<U>> = JoinSet::new();

        loop {
            while running.len() < self.parallel && !self.stop_token.is_cancelled() {
                let Some(item) = self.queue.pop_front() else {
                    break;
                };
                let TaskInfoItem { info, mut unit, .. } = item;
                let wait = if info.retry() > 0 {
                    unit.retry_wait()
                } else {
                    std::time::Duration::ZERO
                };

                debug!("调度任务 {}: 第 {} 次重试", info, info.retry());
                running.spawn(async move {
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    // 单元在独立任务中运行，panic 时仍保留调度信息
                    let run = tokio::spawn(async move {
                        let result = unit.run(&info).await;
                        (unit, result)
                    });
                    match run.await {
                        Ok((unit, result)) => Ok((info, unit, result)),
                        Err(e) => Err(LostTask {
                            info,
                            reason: e.to_string(),
                        }),
                    }
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok((info, unit, result))) => self.handle_finished(info, unit, result),
                Ok(Err(lost)) => {
                    error!("任务 {} 异常退出: {}", lost.info, lost.reason);
                    self.lost.push_back(lost);
                }
                Err(e) => error!("调度任务异常退出: {}", e),
            }
        }

        if self.stop_token.is_cancelled() && !self.queue.is_empty() {
            warn!("执行器已停止, {} 个任务未开始", self.queue.len());
            while let Some(mut item) = self.queue.pop_front() {
                item.unit.on_cancel(&item.info);
                self.cancelled.push_back(item);
            }
        }

        info!(
            "任务执行结束: 成功 {}, 失败 {}, 异常 {}, 未执行 {}, 重试 {} 次",
            self.succeeded,
            self.failed.len(),
            self.lost.len(),
            self.cancelled.len(),
            self.retry_total
        );
    }

    fn handle_finished(&mut self, mut info: TaskInfo, mut unit: U, result: TaskUnitRunResult<U::Error>) {
        if result.succeed {
            self.succeeded += 1;
            unit.on_success(&info);
            unit.on_complete(&info);
            return;
        }

        if result.need_retry && !info.retry_exhausted() {
            info.increase_retry();
            self.retry_total += 1;
            if let Some(err) = &result.err {
                debug!("任务 {} 失败, 重新排队 ({}/{}): {}", info, info.retry(), info.max_retry(), err);
            }
            unit.on_retry(&info, &result);
            self.queue.push_back(TaskInfoItem {
                info,
                unit,
                err: result.err,
            });
            return;
        }

        if let Some(err) = &result.err {
            warn!("任务 {} 最终失败: {}", info, err);
        }
        unit.on_failed(&info, &result);
        unit.on_complete(&info);
        self.failed.push_back(TaskInfoItem {
            info,
            unit,
            err: result.err,
        });
    }

    /// 最终失败的任务（按失败先后顺序），取出后清空
    pub fn failed_deque(&mut self) -> VecDeque<TaskInfoItem<U>> {
        std::mem::take(&mut self.failed)
    }

    /// 因停止而未执行的任务，取出后清空
    pub fn cancelled_deque(&mut self) -> VecDeque<TaskInfoItem<U>> {
        std::mem::take(&mut self.cancelled)
    }

    /// 运行中 panic 的任务（按发生先后顺序），取出后清空
    pub fn lost_deque(&mut self) -> VecDeque<LostTask> {
        std::mem::take(&mut self.lost)
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    /// 本次执行中安排的重试总次数
    pub fn retry_total(&self) -> usize {
        self.retry_total
    }
}
