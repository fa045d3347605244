//! 内存网盘
//!
//! 按内容 MD5 去重的 `PanApi` 内存实现，附带：
//! - 每个接口的调用计数
//! - 同时进行中的调用数统计（可设置每次调用的延迟）
//! - 分片上传故障注入
//!
//! 用于上传流程的测试与演练

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::api::PanApi;
use super::types::{ApiError, ChunkReceipt, RemoteEntry, UploadSessionRequest};
use crate::localfile::pathutil::{clean_remote_path, remote_parent};

/// 各接口调用次数快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    pub resolve_path: usize,
    pub dedup_check: usize,
    pub create_upload_session: usize,
    pub upload_chunk: usize,
    pub finalize: usize,
    pub move_to_recycle_bin: usize,
    pub create_directory: usize,
}

#[derive(Debug, Default)]
struct CallCounters {
    resolve_path: AtomicUsize,
    dedup_check: AtomicUsize,
    create_upload_session: AtomicUsize,
    upload_chunk: AtomicUsize,
    finalize: AtomicUsize,
    move_to_recycle_bin: AtomicUsize,
    create_directory: AtomicUsize,
}

impl CallCounters {
    fn snapshot(&self) -> CallStats {
        CallStats {
            resolve_path: self.resolve_path.load(Ordering::SeqCst),
            dedup_check: self.dedup_check.load(Ordering::SeqCst),
            create_upload_session: self.create_upload_session.load(Ordering::SeqCst),
            upload_chunk: self.upload_chunk.load(Ordering::SeqCst),
            finalize: self.finalize.load(Ordering::SeqCst),
            move_to_recycle_bin: self.move_to_recycle_bin.load(Ordering::SeqCst),
            create_directory: self.create_directory.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
struct MemorySession {
    request: UploadSessionRequest,
    chunks: BTreeMap<usize, Vec<u8>>,
}

/// 调用期间持有，离开作用域时减少进行中计数
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 内存网盘
pub struct MemoryPanClient {
    /// 路径 -> 文件/目录
    entries: DashMap<String, RemoteEntry>,
    /// 内容 MD5 -> 大小
    blobs: DashMap<String, u64>,
    sessions: DashMap<String, MemorySession>,
    recycle_bin: Mutex<Vec<RemoteEntry>>,
    /// 分片索引 -> 剩余失败次数
    chunk_faults: Mutex<HashMap<usize, usize>>,
    counters: CallCounters,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Mutex<Duration>,
    next_id: AtomicU64,
}

impl Default for MemoryPanClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPanClient {
    pub fn new() -> Self {
        let entries = DashMap::new();
        entries.insert(
            "/".to_string(),
            RemoteEntry {
                file_id: "0".to_string(),
                path: "/".to_string(),
                is_dir: true,
                size: 0,
                md5: None,
            },
        );
        Self {
            entries,
            blobs: DashMap::new(),
            sessions: DashMap::new(),
            recycle_bin: Mutex::new(Vec::new()),
            chunk_faults: Mutex::new(HashMap::new()),
            counters: CallCounters::default(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
            next_id: AtomicU64::new(1),
        }
    }

    /// 设置每次调用的模拟延迟
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// 让指定索引的分片在接下来 `times` 次上传时失败（网络错误）
    pub fn inject_chunk_failures(&self, index: usize, times: usize) {
        self.chunk_faults.lock().insert(index, times);
    }

    /// 预置网盘文件（会创建父目录并登记内容，供秒传命中）
    pub fn put_file(&self, path: &str, content: &[u8]) -> Result<RemoteEntry, ApiError> {
        let path = clean_remote_path(path);
        self.mkdir_all(&remote_parent(&path))?;

        let md5 = format!("{:x}", md5::compute(content));
        self.blobs.insert(md5.clone(), content.len() as u64);

        let entry = RemoteEntry {
            file_id: self.new_file_id(),
            path: path.clone(),
            is_dir: false,
            size: content.len() as u64,
            md5: Some(md5),
        };
        self.entries.insert(path, entry.clone());
        Ok(entry)
    }

    /// 丢弃所有未提交的上传会话（模拟服务端回收）
    pub fn forget_sessions(&self) {
        self.sessions.clear();
    }

    pub fn entry(&self, path: &str) -> Option<RemoteEntry> {
        self.entries
            .get(&clean_remote_path(path))
            .map(|e| e.value().clone())
    }

    pub fn recycle_bin(&self) -> Vec<RemoteEntry> {
        self.recycle_bin.lock().clone()
    }

    pub fn calls(&self) -> CallStats {
        self.counters.snapshot()
    }

    /// 运行期间同时进行中的调用数峰值
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 会话中已收到的分片索引
    pub fn received_chunks(&self, session_id: &str) -> Vec<usize> {
        self.sessions
            .get(session_id)
            .map(|s| s.chunks.keys().copied().collect())
            .unwrap_or_default()
    }

    fn new_file_id(&self) -> String {
        format!("F{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn enter(&self, counter: &AtomicUsize) -> InFlightGuard<'_> {
        counter.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let guard = InFlightGuard {
            counter: &self.in_flight,
        };
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn mkdir_all(&self, path: &str) -> Result<RemoteEntry, ApiError> {
        let mut current = String::new();
        let mut last = None;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(seg);
            let entry = self
                .entries
                .entry(current.clone())
                .or_insert_with(|| RemoteEntry {
                    file_id: self.new_file_id(),
                    path: current.clone(),
                    is_dir: true,
                    size: 0,
                    md5: None,
                })
                .value()
                .clone();
            if !entry.is_dir {
                return Err(ApiError::rejected(409, format!("同名文件已存在: {}", current)));
            }
            last = Some(entry);
        }
        match last {
            Some(entry) => Ok(entry),
            None => self
                .entries
                .get("/")
                .map(|e| e.value().clone())
                .ok_or_else(|| ApiError::NotFound("/".to_string())),
        }
    }

    fn has_blob(&self, md5: &str, size: u64) -> bool {
        self.blobs.get(md5).map(|s| *s == size).unwrap_or(false)
    }
}

fn expected_chunks(size: u64, chunk_size: u64) -> usize {
    if size == 0 {
        0
    } else {
        size.div_ceil(chunk_size.max(1)) as usize
    }
}

#[async_trait]
impl PanApi for MemoryPanClient {
    async fn resolve_path(&self, path: &str) -> Result<Option<RemoteEntry>, ApiError> {
        let _guard = self.enter(&self.counters.resolve_path).await;
        Ok(self.entry(path))
    }

    async fn dedup_check(&self, size: u64, content_md5: &str) -> Result<bool, ApiError> {
        let _guard = self.enter(&self.counters.dedup_check).await;
        Ok(self.has_blob(content_md5, size))
    }

    async fn create_upload_session(&self, req: &UploadSessionRequest) -> Result<String, ApiError> {
        let _guard = self.enter(&self.counters.create_upload_session).await;
        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            MemorySession {
                request: req.clone(),
                chunks: BTreeMap::new(),
            },
        );
        debug!("创建上传会话: {} -> {}", session_id, req.target_path);
        Ok(session_id)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: usize,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<ChunkReceipt, ApiError> {
        let _guard = self.enter(&self.counters.upload_chunk).await;

        {
            let mut faults = self.chunk_faults.lock();
            if let Some(left) = faults.get_mut(&index) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ApiError::Network(format!("分片 #{} 连接被重置", index)));
                }
            }
        }

        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ApiError::SessionExpired(session_id.to_string()))?;

        if offset != index as u64 * session.request.chunk_size {
            return Err(ApiError::rejected(
                400,
                format!("分片 #{} 偏移量错误: {}", index, offset),
            ));
        }

        let md5 = format!("{:x}", md5::compute(&data));
        session.chunks.insert(index, data);
        Ok(ChunkReceipt { index, md5 })
    }

    async fn finalize(&self, session_id: &str, target_path: &str) -> Result<RemoteEntry, ApiError> {
        let _guard = self.enter(&self.counters.finalize).await;
        let target = clean_remote_path(target_path);

        let request = self
            .sessions
            .get(session_id)
            .map(|s| s.request.clone())
            .ok_or_else(|| ApiError::SessionExpired(session_id.to_string()))?;

        let parent = remote_parent(&target);
        match self.entries.get(&parent) {
            Some(e) if e.is_dir => {}
            _ => return Err(ApiError::NotFound(parent)),
        }
        if self.entries.contains_key(&target) {
            return Err(ApiError::rejected(409, format!("文件已存在: {}", target)));
        }

        if !self.has_blob(&request.content_md5, request.size) {
            let session = self
                .sessions
                .get(session_id)
                .ok_or_else(|| ApiError::SessionExpired(session_id.to_string()))?;

            let mut hasher = md5::Context::new();
            let mut total = 0u64;
            for index in 0..expected_chunks(request.size, request.chunk_size) {
                let data = session
                    .chunks
                    .get(&index)
                    .ok_or_else(|| ApiError::rejected(400, format!("缺少分片 #{}", index)))?;
                hasher.consume(data);
                total += data.len() as u64;
            }
            if total != request.size || format!("{:x}", hasher.compute()) != request.content_md5 {
                return Err(ApiError::rejected(400, "文件校验失败"));
            }
        }

        self.sessions.remove(session_id);
        self.blobs.insert(request.content_md5.clone(), request.size);

        let entry = RemoteEntry {
            file_id: self.new_file_id(),
            path: target.clone(),
            is_dir: false,
            size: request.size,
            md5: Some(request.content_md5),
        };
        self.entries.insert(target, entry.clone());
        Ok(entry)
    }

    async fn move_to_recycle_bin(&self, file_id: &str) -> Result<(), ApiError> {
        let _guard = self.enter(&self.counters.move_to_recycle_bin).await;

        let path = self
            .entries
            .iter()
            .find(|e| e.file_id == file_id)
            .map(|e| e.key().clone());
        let Some(path) = path else {
            return Err(ApiError::NotFound(file_id.to_string()));
        };

        if let Some((_, entry)) = self.entries.remove(&path) {
            self.recycle_bin.lock().push(entry);
        }
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> Result<RemoteEntry, ApiError> {
        let _guard = self.enter(&self.counters.create_directory).await;
        self.mkdir_all(&clean_remote_path(path))
    }
}
