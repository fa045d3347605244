//! 网盘目录创建
//!
//! 同一次运行中的所有上传任务共用一个创建器：已确认存在的目录缓存在内存里，
//! 真正的创建调用在一把全局锁内串行执行，并在锁内再次检查缓存，
//! 因此多个任务同时需要同一个新目录时只会创建一次。

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::localfile::clean_remote_path;
use crate::netdisk::{ApiError, PanApi};

pub struct FolderCreator {
    client: Arc<dyn PanApi>,
    /// 已确认存在的目录
    known_dirs: Mutex<HashSet<String>>,
}

impl FolderCreator {
    pub fn new(client: Arc<dyn PanApi>) -> Self {
        Self {
            client,
            known_dirs: Mutex::new(HashSet::new()),
        }
    }

    /// 确保网盘目录存在（含中间目录）
    pub async fn ensure_dir(&self, dir: &str) -> Result<(), ApiError> {
        let dir = clean_remote_path(dir);
        if dir == "/" || self.known_dirs.lock().await.contains(&dir) {
            return Ok(());
        }

        match self.client.resolve_path(&dir).await? {
            Some(entry) if entry.is_dir => {
                self.known_dirs.lock().await.insert(dir);
                return Ok(());
            }
            Some(_) => {
                return Err(ApiError::rejected(409, format!("同名文件已存在, 无法创建目录: {}", dir)));
            }
            None => {}
        }

        let mut known = self.known_dirs.lock().await;
        if known.contains(&dir) {
            debug!("目录已由其他任务创建: {}", dir);
            return Ok(());
        }
        self.client.create_directory(&dir).await?;
        info!("创建网盘目录: {}", dir);
        known.insert(dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdisk::MemoryPanClient;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_ensure_creates_once() {
        let client = Arc::new(MemoryPanClient::new());
        client.set_latency(Duration::from_millis(10));
        let creator = Arc::new(FolderCreator::new(client.clone()));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let creator = creator.clone();
            handles.push(tokio::spawn(async move { creator.ensure_dir("/new/dir").await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(client.calls().create_directory, 1);
        assert!(client.entry("/new/dir").unwrap().is_dir);

        let resolves = client.calls().resolve_path;
        creator.ensure_dir("/new/dir/").await.unwrap();
        assert_eq!(client.calls().resolve_path, resolves);
    }

    #[tokio::test]
    async fn test_existing_dir_and_conflicts() {
        let client = Arc::new(MemoryPanClient::new());
        client.create_directory("/exists").await.unwrap();
        client.put_file("/file", b"x").unwrap();
        let creator = FolderCreator::new(client.clone());

        creator.ensure_dir("/exists").await.unwrap();
        creator.ensure_dir("/").await.unwrap();
        assert_eq!(client.calls().create_directory, 1);

        let err = creator.ensure_dir("/file").await.unwrap_err();
        assert!(matches!(err, ApiError::Rejected { code: 409, .. }));
    }
}
