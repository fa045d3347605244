// 网盘上传接口
//
// 上传流程只依赖这个 trait，认证、HTTP 传输等由具体实现负责

use async_trait::async_trait;

use super::types::{ApiError, ChunkReceipt, RemoteEntry, UploadSessionRequest};

/// 上传流程所需的网盘操作
///
/// 实现必须可被多个上传任务并发调用
#[async_trait]
pub trait PanApi: Send + Sync {
    /// 查询网盘路径，不存在时返回 `Ok(None)`
    async fn resolve_path(&self, path: &str) -> Result<Option<RemoteEntry>, ApiError>;

    /// 秒传检查：服务器是否已存有相同内容
    async fn dedup_check(&self, size: u64, content_md5: &str) -> Result<bool, ApiError>;

    /// 创建上传会话，返回会话 ID
    async fn create_upload_session(&self, req: &UploadSessionRequest) -> Result<String, ApiError>;

    /// 上传一个分片
    async fn upload_chunk(
        &self,
        session_id: &str,
        index: usize,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<ChunkReceipt, ApiError>;

    /// 提交会话，在目标路径生成文件
    async fn finalize(&self, session_id: &str, target_path: &str) -> Result<RemoteEntry, ApiError>;

    /// 将文件移入回收站
    async fn move_to_recycle_bin(&self, file_id: &str) -> Result<(), ApiError>;

    /// 创建目录（含中间目录），目录已存在时视为成功
    async fn create_directory(&self, path: &str) -> Result<RemoteEntry, ApiError>;
}
