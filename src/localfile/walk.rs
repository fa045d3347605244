//! 本地目录遍历
//!
//! 把一个本地根路径（文件或文件夹）展开成待上传文件列表，
//! 并按根路径的父目录计算每个文件在网盘上的目标路径：
//!
//! ```text
//! 本地 /home/u/photos/2024/a.jpg，根 /home/u/photos，保存到 /backup
//! => /backup/photos/2024/a.jpg
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::pathutil::{join_remote, to_unix_separator};

/// 遍历得到的一个待上传文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// 本地绝对路径
    pub local_path: PathBuf,
    /// 网盘目标路径
    pub remote_path: String,
    /// 遍历时的文件大小
    pub size: u64,
}

/// 遍历选项
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

/// 展开一个本地根路径
///
/// 根路径不存在或无法规范化时返回错误；遍历中无法读取的条目跳过并记录警告
pub fn scan_root(root: &Path, save_path: &str, options: &ScanOptions) -> Result<Vec<PlannedFile>> {
    let root = dunce::canonicalize(root)
        .with_context(|| format!("本地路径不存在或无法访问: {}", root.display()))?;
    let base = root.parent().map(Path::to_path_buf).unwrap_or_default();

    info!("开始扫描: {}", root.display());

    let mut files = Vec::new();
    let walker = WalkDir::new(&root)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(options.skip_hidden && is_hidden(e)));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("遍历错误, 已跳过: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                warn!("读取文件元数据失败, 已跳过: {}, 错误: {}", entry.path().display(), e);
                continue;
            }
        };

        let relative = entry
            .path()
            .strip_prefix(&base)
            .with_context(|| format!("计算相对路径失败: {}", entry.path().display()))?;
        let remote_path = join_remote(save_path, &to_unix_separator(&relative.to_string_lossy()));

        debug!("扫描到文件: {} -> {}", entry.path().display(), remote_path);
        files.push(PlannedFile {
            local_path: entry.into_path(),
            remote_path,
            size,
        });
    }

    info!("扫描完成: {}, {} 个文件", root.display(), files.len());
    Ok(files)
}

/// 在阻塞线程池中执行 [`scan_root`]
pub async fn scan_root_async(
    root: PathBuf,
    save_path: String,
    options: ScanOptions,
) -> Result<Vec<PlannedFile>> {
    tokio::task::spawn_blocking(move || scan_root(&root, &save_path, &options))
        .await
        .context("扫描任务执行失败")?
}
