// 上传引擎模块
//
// 单文件状态机（unit）+ 批量入口（runner）：
// - 秒传：按内容 MD5 命中时不传输数据
// - 分片并发上传，已提交分片写入续传记录
// - 同一次运行共用目录创建器，同名目录只创建一次

pub mod chunk;
pub mod error;
pub mod folder;
pub mod options;
pub mod progress;
pub mod runner;
pub mod statistic;
pub mod unit;

pub use chunk::{UploadChunk, UploadChunkManager, DEFAULT_UPLOAD_CHUNK_SIZE};
pub use error::UploadError;
pub use folder::FolderCreator;
pub use options::UploadOptions;
pub use progress::{format_bytes, ProgressSnapshot, ProgressThrottler, UploadProgress};
pub use runner::{
    run_upload, run_upload_with_config, run_upload_with_stop, AdmittedFile, FailedFile,
    RejectedPath, UploadReport,
};
pub use statistic::UploadStatistic;
pub use unit::{UploadContext, UploadOutcome, UploadStep, UploadTaskUnit};
