// 上传统计
//
// 每次运行一份，由所有并发上传任务共享

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct UploadStatistic {
    total_size: AtomicU64,
    file_count: AtomicUsize,
    rapid_count: AtomicUsize,
    started_at: OnceLock<Instant>,
}

impl UploadStatistic {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始计时，只有第一次调用生效
    pub fn start_timer(&self) {
        let _ = self.started_at.set(Instant::now());
    }

    pub fn add_total_size(&self, size: u64) {
        self.total_size.fetch_add(size, Ordering::SeqCst);
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    /// 记录一个完成的文件
    pub fn add_file(&self, rapid: bool) {
        self.file_count.fetch_add(1, Ordering::SeqCst);
        if rapid {
            self.rapid_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn file_count(&self) -> usize {
        self.file_count.load(Ordering::SeqCst)
    }

    pub fn rapid_count(&self) -> usize {
        self.rapid_count.load(Ordering::SeqCst)
    }

    /// 自 start_timer 起经过的时间，未开始计时为 0
    pub fn elapsed(&self) -> Duration {
        self.started_at
            .get()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}
