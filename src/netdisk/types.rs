// 网盘 API 数据类型

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 网盘中的文件或目录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// 网盘文件 ID
    pub file_id: String,
    /// 网盘绝对路径
    pub path: String,
    /// 是否为目录
    pub is_dir: bool,
    /// 文件大小（目录为 0）
    pub size: u64,
    /// 文件 MD5（目录为 None）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

/// 创建上传会话的请求参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSessionRequest {
    /// 网盘目标路径
    pub target_path: String,
    /// 文件大小
    pub size: u64,
    /// 文件完整 MD5
    pub content_md5: String,
    /// 各分片 MD5（按顺序）
    pub slice_md5s: Vec<String>,
    /// 分片大小
    pub chunk_size: u64,
}

/// 分片上传回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// 分片索引
    pub index: usize,
    /// 服务器计算的分片 MD5
    pub md5: String,
}

/// 网盘 API 错误类型
///
/// 与失败原因对应，供上层做重试判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误（可重试）
    ServerError,
    /// 限流（可重试）
    RateLimited,
    /// 文件不存在
    FileNotFound,
    /// 权限不足
    Forbidden,
    /// 参数错误
    BadRequest,
    /// 文件已存在
    FileExists,
    /// 空间不足
    QuotaExceeded,
    /// 上传会话已失效
    SessionExpired,
    /// 未知错误
    Unknown,
}

impl ApiErrorKind {
    /// 是否为瞬时错误（网络抖动、服务端临时故障）
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ApiErrorKind::Network
                | ApiErrorKind::Timeout
                | ApiErrorKind::ServerError
                | ApiErrorKind::RateLimited
        )
    }

    /// 从服务端返回码转换
    pub fn from_code(code: i32) -> Self {
        match code {
            400 => ApiErrorKind::BadRequest,
            401 | 403 => ApiErrorKind::Forbidden,
            404 => ApiErrorKind::FileNotFound,
            409 => ApiErrorKind::FileExists,
            410 => ApiErrorKind::SessionExpired,
            429 => ApiErrorKind::RateLimited,
            507 => ApiErrorKind::QuotaExceeded,
            500..=599 => ApiErrorKind::ServerError,
            _ => ApiErrorKind::Unknown,
        }
    }
}

/// 网盘 API 错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("网盘路径不存在: {0}")]
    NotFound(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("请求超时: {0}")]
    Timeout(String),
    #[error("请求被限流")]
    RateLimited,
    #[error("上传会话已失效: {0}")]
    SessionExpired(String),
    #[error("服务端拒绝: {code} - {message}")]
    Rejected { code: i32, message: String },
}

impl ApiError {
    pub fn rejected(code: i32, message: impl Into<String>) -> Self {
        ApiError::Rejected {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ApiErrorKind {
        match self {
            ApiError::NotFound(_) => ApiErrorKind::FileNotFound,
            ApiError::Network(_) => ApiErrorKind::Network,
            ApiError::Timeout(_) => ApiErrorKind::Timeout,
            ApiError::RateLimited => ApiErrorKind::RateLimited,
            ApiError::SessionExpired(_) => ApiErrorKind::SessionExpired,
            ApiError::Rejected { code, .. } => ApiErrorKind::from_code(*code),
        }
    }
}
