//! 持久化模块
//!
//! 断点续传记录：文件身份标识 -> 远端上传会话与已提交分片，进程重启后仍然有效

pub mod ledger;
pub mod types;

pub use ledger::{LedgerError, ResumableLedger};
pub use types::LedgerRecord;
