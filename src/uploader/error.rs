// 上传错误分类
//
// 执行器只看 is_retryable()，具体原因留给最终的失败报告

use std::io;

use thiserror::Error;

use crate::netdisk::ApiError;
use crate::persistence::LedgerError;

#[derive(Debug, Error)]
pub enum UploadError {
    /// 本地文件暂时不可读、网络抖动、服务端临时故障
    #[error("传输失败: {0}")]
    TransientIo(String),
    /// 文件在上传过程中被修改，续传记录已作废
    #[error("文件已被修改: {0}")]
    ContentChanged(String),
    /// 服务端拒绝（配额、权限、会话失效等）
    #[error("{0}")]
    RemoteRejected(String),
    /// 本地路径无效等配置问题
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("续传记录错误: {0}")]
    Ledger(#[from] LedgerError),
}

impl UploadError {
    /// 配置错误之外都可以交给执行器重试
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UploadError::Configuration(_))
    }

    /// 本地文件 I/O 错误：文件不存在或不是普通文件属于配置错误，其余视为瞬时错误
    pub fn from_local_io(path: &std::path::Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => {
                UploadError::Configuration(format!("{}: {}", path.display(), err))
            }
            _ => UploadError::TransientIo(format!("{}: {}", path.display(), err)),
        }
    }
}

impl From<ApiError> for UploadError {
    fn from(err: ApiError) -> Self {
        if err.kind().is_retriable() {
            UploadError::TransientIo(err.to_string())
        } else {
            UploadError::RemoteRejected(err.to_string())
        }
    }
}
