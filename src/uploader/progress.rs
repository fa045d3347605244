//! 上传进度输出
//!
//! 分片完成时累加进度，按时间间隔节流后输出一行进度日志

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 1000;

/// 尚未输出过
const NEVER: u64 = u64::MAX;

/// 进度节流器
///
/// 线程安全，使用原子操作避免锁竞争
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    /// 上次输出时间（相对 origin 的纳秒）
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(NEVER),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次输出超过间隔（或从未输出）时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != NEVER && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        // 被其他线程抢先更新时本次不输出
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

/// 某一时刻的上传进度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub uploaded: u64,
    pub total: u64,
    /// 字节/秒
    pub speed: u64,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.uploaded as f64 / self.total as f64 * 100.0
    }
}

/// 单个文件的上传进度
#[derive(Debug)]
pub struct UploadProgress {
    task_id: u64,
    total: u64,
    uploaded: AtomicU64,
    started: Instant,
    throttler: ProgressThrottler,
}

impl UploadProgress {
    /// `already_uploaded` 为续传时已提交分片的字节数
    pub fn new(task_id: u64, total: u64, already_uploaded: u64, throttler: ProgressThrottler) -> Self {
        Self {
            task_id,
            total,
            uploaded: AtomicU64::new(already_uploaded.min(total)),
            started: Instant::now(),
            throttler,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let uploaded = self.uploaded.load(Ordering::Relaxed);
        let secs = self.started.elapsed().as_secs_f64();
        let speed = if secs > 0.0 {
            (uploaded as f64 / secs) as u64
        } else {
            0
        };
        ProgressSnapshot {
            uploaded,
            total: self.total,
            speed,
        }
    }

    /// 累加进度，未被节流时输出进度日志并返回快照
    pub fn advance(&self, bytes: u64) -> Option<ProgressSnapshot> {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        if !self.throttler.should_emit() {
            return None;
        }
        let snapshot = self.snapshot();
        info!(
            "[{}] ↑ {}/{} ({:.1}%) {}/s",
            self.task_id,
            format_bytes(snapshot.uploaded),
            format_bytes(snapshot.total),
            snapshot.percent(),
            format_bytes(snapshot.speed)
        );
        Some(snapshot)
    }
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
