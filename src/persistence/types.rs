//! 断点续传记录类型定义

use std::path::Path;
use std::time::Duration;

use bit_set::BitSet;
use chrono::{DateTime, Utc};

use crate::localfile::FileDigests;

/// 记录有效期上限
fn max_ttl() -> chrono::Duration {
    chrono::Duration::days(365 * 100)
}

/// 一个未完成上传的续传记录
///
/// 以文件身份标识（路径 + 大小 + 修改时间）为键，记录远端上传会话和已提交的分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    /// 文件身份标识
    pub key: String,
    /// 本地文件路径
    pub local_path: String,
    /// 创建记录时的文件大小
    pub size: u64,
    /// 创建记录时的修改时间（UNIX 秒）
    pub mod_time: i64,
    /// 远端上传会话 ID
    pub session_id: String,
    /// 分片大小
    pub chunk_size: u64,
    /// 已提交的分片集合
    pub committed_chunks: BitSet,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LedgerRecord {
    /// 为一个新的上传会话创建记录
    pub fn new_session(
        local_path: &Path,
        digests: &FileDigests,
        session_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| max_ttl())
            .min(max_ttl());
        Self {
            key: digests.identity_key.clone(),
            local_path: local_path.to_string_lossy().into_owned(),
            size: digests.stat.size,
            mod_time: digests.stat.mod_time,
            session_id: session_id.into(),
            chunk_size: digests.chunk_size,
            committed_chunks: BitSet::new(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// 标记分片已提交，返回是否为新提交
    pub fn mark_committed(&mut self, index: usize) -> bool {
        self.committed_chunks.insert(index)
    }

    pub fn committed_count(&self) -> usize {
        self.committed_chunks.len()
    }

    /// 已提交分片索引（升序）
    pub fn committed_indices(&self) -> Vec<usize> {
        self.committed_chunks.iter().collect()
    }

    /// 记录是否仍对应当前文件（大小、修改时间、分片大小都一致才可续传）
    pub fn matches(&self, size: u64, mod_time: i64, chunk_size: u64) -> bool {
        self.size == size && self.mod_time == mod_time && self.chunk_size == chunk_size
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
