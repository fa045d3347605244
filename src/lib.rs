// Cloud Pan Uploader Library
// 网盘批量上传核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 本地文件模块（遍历、校验）
pub mod localfile;

// 网盘API模块
pub mod netdisk;

// 断点续传记录模块
pub mod persistence;

// 任务执行框架
pub mod taskframework;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use netdisk::{ApiError, MemoryPanClient, PanApi};
pub use persistence::ResumableLedger;
pub use taskframework::{TaskExecutor, TaskUnit};
pub use uploader::{run_upload, UploadError, UploadOptions, UploadReport, UploadTaskUnit};
