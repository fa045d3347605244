//! 本地/网盘路径处理
//!
//! 网盘路径统一使用 `/` 分隔并以 `/` 开头

/// 网盘路径分隔符
pub const REMOTE_SEPARATOR: char = '/';

/// 将 Windows 风格分隔符转换为 `/`
pub fn to_unix_separator(path: &str) -> String {
    path.replace('\\', "/")
}

/// 规范化网盘路径：去除多余分隔符、`.` 和 `..`
pub fn clean_remote_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split(REMOTE_SEPARATOR) {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// 拼接网盘路径
pub fn join_remote(base: &str, sub: &str) -> String {
    clean_remote_path(&format!("{}/{}", base, sub))
}

/// 网盘路径的父目录（根目录的父目录仍为根目录）
pub fn remote_parent(path: &str) -> String {
    let cleaned = clean_remote_path(path);
    match cleaned.rsplit_once(REMOTE_SEPARATOR) {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}
