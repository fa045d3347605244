// 上传分片管理
//
// 文件按固定分片大小切分，最后一个分片可能较小；空文件没有分片

use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;

use bit_set::BitSet;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 默认上传分片大小: 4MB
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 是否已提交
    pub completed: bool,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            completed: false,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 分片在文件中的偏移
    pub fn offset(&self) -> u64 {
        self.range.start
    }

    /// 读取分片数据
    pub async fn read_data(&self, file_path: &Path) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(file_path).await?;
        file.seek(SeekFrom::Start(self.range.start)).await?;

        let mut buffer = vec![0u8; self.size() as usize];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.index,
            self.range.start,
            self.range.end.saturating_sub(1),
            buffer.len()
        );
        Ok(buffer)
    }
}

/// 上传分片管理器
#[derive(Debug)]
pub struct UploadChunkManager {
    chunks: Vec<UploadChunk>,
    total_size: u64,
}

impl UploadChunkManager {
    /// `chunk_size` 为 0 时按 1 处理
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunks: Self::plan_chunks(total_size, chunk_size),
            total_size,
        }
    }

    fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
        let count = total_size.div_ceil(chunk_size) as usize;
        (0..count)
            .map(|index| {
                let start = index as u64 * chunk_size;
                UploadChunk::new(index, start..start.saturating_add(chunk_size).min(total_size))
            })
            .collect()
    }

    /// 用续传记录中的已提交分片初始化完成状态，返回恢复的分片数
    pub fn restore_committed(&mut self, committed: &BitSet) -> usize {
        let mut restored = 0;
        for chunk in &mut self.chunks {
            if committed.contains(chunk.index) {
                chunk.completed = true;
                restored += 1;
            }
        }
        restored
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    /// 未提交的分片（按索引顺序）
    pub fn pending(&self) -> Vec<UploadChunk> {
        self.chunks.iter().filter(|c| !c.completed).cloned().collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.completed).count()
    }

    /// 已提交的字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.completed)
            .map(|c| c.size())
            .sum()
    }

    /// 上传进度（百分比），空文件视为 100
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        (self.uploaded_bytes() as f64 / self.total_size as f64) * 100.0
    }

    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.completed)
    }

    pub fn mark_completed(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.completed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_last_chunk_may_be_short() {
        const MB: u64 = 1024 * 1024;
        let even = UploadChunkManager::new(8 * MB, DEFAULT_UPLOAD_CHUNK_SIZE);
        let ranges: Vec<_> = even.chunks().iter().map(|c| c.range.clone()).collect();
        assert_eq!(ranges, vec![0..4 * MB, 4 * MB..8 * MB]);

        let uneven = UploadChunkManager::new(9 * MB, DEFAULT_UPLOAD_CHUNK_SIZE);
        assert_eq!(uneven.chunk_count(), 3);
        assert_eq!(uneven.chunks()[2].size(), MB);
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        let manager = UploadChunkManager::new(0, DEFAULT_UPLOAD_CHUNK_SIZE);
        assert_eq!(manager.chunk_count(), 0);
        assert!(manager.is_completed());
        assert_eq!(manager.progress(), 100.0);
    }

    #[test]
    fn test_restore_and_progress() {
        let mut manager = UploadChunkManager::new(16, 4);
        let mut committed = BitSet::new();
        committed.insert(0);
        committed.insert(2);
        committed.insert(9);

        assert_eq!(manager.restore_committed(&committed), 2);
        assert_eq!(manager.completed_count(), 2);
        assert_eq!(manager.uploaded_bytes(), 8);
        assert_eq!(manager.progress(), 50.0);

        let pending: Vec<usize> = manager.pending().iter().map(|c| c.index).collect();
        assert_eq!(pending, vec![1, 3]);

        manager.mark_completed(1);
        manager.mark_completed(3);
        assert!(manager.is_completed());
        assert!(manager.pending().is_empty());
    }

    #[tokio::test]
    async fn test_read_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let manager = UploadChunkManager::new(10, 4);
        assert_eq!(manager.chunks()[1].read_data(&path).await.unwrap(), b"4567");
        assert_eq!(manager.chunks()[2].read_data(&path).await.unwrap(), b"89");
    }

    proptest! {
        #[test]
        fn prop_chunks_tile_the_file(size in 0u64..100_000, chunk_size in 1u64..10_000) {
            let manager = UploadChunkManager::new(size, chunk_size);
            let chunks = manager.chunks();

            prop_assert_eq!(chunks.len() as u64, size.div_ceil(chunk_size));
            let mut expected_start = 0;
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.range.start, expected_start);
                prop_assert!(chunk.size() > 0 && chunk.size() <= chunk_size);
                expected_start = chunk.range.end;
            }
            prop_assert_eq!(expected_start, size);
        }
    }
}
