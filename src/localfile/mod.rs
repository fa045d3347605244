// 本地文件模块

pub mod checksum;
pub mod pathutil;
pub mod walk;

pub use checksum::{identity_key, FileDigests, FileStat, LocalFileEntity};
pub use pathutil::{clean_remote_path, join_remote, remote_parent, to_unix_separator};
pub use walk::{scan_root, scan_root_async, PlannedFile, ScanOptions};
