// 本地文件校验信息
//
// 一次顺序读取同时得到：
// 1. 文件完整 MD5（秒传检查、提交校验）
// 2. 每个分片的 MD5（分片完整性校验、断点续传）
// 3. 前 256KB 的 MD5（服务端兼容字段）

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use md5::Context as Md5Context;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::debug;

/// 前 256KB 的大小常量
const HEAD_SIZE: u64 = 256 * 1024;

/// 读取缓冲区大小
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 文件大小与修改时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// 修改时间（UNIX 秒）
    pub mod_time: i64,
}

impl FileStat {
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let mod_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            size: metadata.len(),
            mod_time,
        }
    }
}

/// 计算完成的校验信息，计算后不再变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    /// 计算时的文件状态
    pub stat: FileStat,
    /// 完整内容 MD5
    pub full_md5: String,
    /// 前 256KB MD5
    pub head_md5: String,
    /// 各分片 MD5（空文件为空列表）
    pub slice_md5s: Vec<String>,
    /// 实际使用的分片大小
    pub chunk_size: u64,
    /// 文件身份标识，见 [`identity_key`]
    pub identity_key: String,
}

/// 文件身份标识：路径 + 大小 + 修改时间的 SHA-256
pub fn identity_key(local_path: &Path, size: u64, mod_time: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}\n{}\n{}", local_path.display(), size, mod_time).as_bytes());
    hex::encode(hasher.finalize())
}

/// 本地待上传文件
///
/// 校验信息懒计算并缓存，同一个任务的多次重试共享同一份结果
#[derive(Debug)]
pub struct LocalFileEntity {
    local_path: PathBuf,
    digests: OnceCell<Arc<FileDigests>>,
}

impl LocalFileEntity {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            digests: OnceCell::new(),
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// 读取当前文件状态
    pub async fn stat(&self) -> io::Result<FileStat> {
        let metadata = tokio::fs::metadata(&self.local_path).await?;
        if metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("不是普通文件: {:?}", self.local_path),
            ));
        }
        Ok(FileStat::from_metadata(&metadata))
    }

    /// 计算（或返回已缓存的）校验信息
    ///
    /// `chunk_size` 为 0 表示不分片，整个文件作为一个分片。
    /// 已缓存时忽略参数直接返回缓存
    pub async fn checksum(&self, chunk_size: u64) -> io::Result<Arc<FileDigests>> {
        let digests = self
            .digests
            .get_or_try_init(|| async {
                let path = self.local_path.clone();
                tokio::task::spawn_blocking(move || compute_digests(&path, chunk_size))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(digests))
    }

    /// 已缓存的校验信息
    pub fn cached(&self) -> Option<Arc<FileDigests>> {
        self.digests.get().cloned()
    }

    /// 文件自计算校验信息后是否被修改过（未计算时返回 false）
    pub async fn has_changed(&self) -> io::Result<bool> {
        let Some(digests) = self.digests.get() else {
            return Ok(false);
        };
        let current = self.stat().await?;
        Ok(current != digests.stat)
    }

    /// 丢弃已缓存的校验信息（文件内容变化后使用）
    pub fn invalidate(&mut self) {
        self.digests = OnceCell::new();
    }
}

fn compute_digests(path: &Path, chunk_size: u64) -> io::Result<FileDigests> {
    let file = std::fs::File::open(path)?;
    let metadata = file.metadata()?;
    if metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("不是普通文件: {:?}", path),
        ));
    }
    let before = FileStat::from_metadata(&metadata);
    let slice_len = if chunk_size == 0 {
        before.size.max(1)
    } else {
        chunk_size
    };

    let mut reader = io::BufReader::with_capacity(1024 * 1024, file);
    let mut full_hasher = Md5Context::new();
    let mut head_hasher = Md5Context::new();
    let mut slice_hasher = Md5Context::new();
    let mut head_read = 0u64;
    let mut slice_filled = 0u64;
    let mut total_read = 0u64;
    let mut slice_md5s = Vec::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        let data = &buffer[..n];
        full_hasher.consume(data);
        total_read += n as u64;

        if head_read < HEAD_SIZE {
            let take = (HEAD_SIZE - head_read).min(n as u64) as usize;
            head_hasher.consume(&data[..take]);
            head_read += take as u64;
        }

        // 按分片边界切分当前缓冲区
        let mut rest = data;
        while !rest.is_empty() {
            let take = (slice_len - slice_filled).min(rest.len() as u64) as usize;
            slice_hasher.consume(&rest[..take]);
            slice_filled += take as u64;
            rest = &rest[take..];
            if slice_filled == slice_len {
                let done = std::mem::replace(&mut slice_hasher, Md5Context::new());
                slice_md5s.push(format!("{:x}", done.compute()));
                slice_filled = 0;
            }
        }
    }
    if slice_filled > 0 {
        slice_md5s.push(format!("{:x}", slice_hasher.compute()));
    }

    let after = FileStat::from_metadata(&std::fs::metadata(path)?);
    if after != before || total_read != before.size {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            format!("计算哈希期间文件被修改: {:?}", path),
        ));
    }

    let full_md5 = format!("{:x}", full_hasher.compute());
    let head_md5 = format!("{:x}", head_hasher.compute());
    debug!(
        "文件哈希计算完成: path={:?}, size={}, content_md5={}, 分片数={}",
        path,
        before.size,
        full_md5,
        slice_md5s.len()
    );

    Ok(FileDigests {
        stat: before,
        identity_key: identity_key(path, before.size, before.mod_time),
        full_md5,
        head_md5,
        slice_md5s,
        chunk_size: slice_len,
    })
}
