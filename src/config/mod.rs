// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::uploader::UploadOptions;

/// 默认上传分片大小（MB）
pub const DEFAULT_CHUNK_SIZE_MB: u64 = 4;

/// 允许的最大分片大小（MB）
pub const MAX_CHUNK_SIZE_MB: u64 = 64;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传配置
///
/// 字段与上传命令的可选项一一对应，`to_options()` 转换为运行时参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 同时上传的文件数
    #[serde(default = "default_all_parallel")]
    pub all_parallel: usize,
    /// 单个文件同时上传的分片数
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// 单个文件失败后的最大重试次数
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// 禁用秒传
    #[serde(default)]
    pub no_rapid_upload: bool,
    /// 禁用分片上传（整个文件作为一个分片）
    #[serde(default)]
    pub no_split_file: bool,
    /// 输出单文件上传进度
    #[serde(default)]
    pub show_progress: bool,
    /// 覆盖同名文件（旧文件先移入回收站）
    #[serde(default)]
    pub is_overwrite: bool,
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
}

fn default_all_parallel() -> usize {
    1
}

fn default_parallel() -> usize {
    1
}

fn default_max_retry() -> u32 {
    3
}

fn default_chunk_size_mb() -> u64 {
    DEFAULT_CHUNK_SIZE_MB
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            all_parallel: default_all_parallel(),
            parallel: default_parallel(),
            max_retry: default_max_retry(),
            no_rapid_upload: false,
            no_split_file: false,
            show_progress: false,
            is_overwrite: false,
            chunk_size_mb: default_chunk_size_mb(),
        }
    }
}

impl UploadConfig {
    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_mb == 0 || self.chunk_size_mb > MAX_CHUNK_SIZE_MB {
            anyhow::bail!(
                "分片大小必须在 1-{}MB 之间，当前: {}MB",
                MAX_CHUNK_SIZE_MB,
                self.chunk_size_mb
            );
        }
        Ok(())
    }

    /// 转换为上传运行参数
    pub fn to_options(&self) -> UploadOptions {
        UploadOptions {
            all_parallel: self.all_parallel,
            parallel: self.parallel,
            max_retry: self.max_retry,
            no_rapid_upload: self.no_rapid_upload,
            no_split_file: self.no_split_file,
            show_progress: self.show_progress,
            is_overwrite: self.is_overwrite,
            chunk_size: self.chunk_size_mb * 1024 * 1024,
        }
        .normalized()
    }
}

/// 持久化配置
///
/// 断点续传记录保存在 SQLite 文件中，进程重启后可继续使用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 上传记录数据库路径
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    /// 上传会话有效期（小时），过期记录不再用于续传
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/uploading.db")
}

fn default_session_ttl_hours() -> u64 {
    7 * 24
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

impl PersistenceConfig {
    /// 会话有效期
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours * 3600)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {}", path);

        Ok(())
    }

    /// 加载或使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.all_parallel, 1);
        assert_eq!(config.upload.parallel, 1);
        assert_eq!(config.upload.max_retry, 3);
        assert!(!config.upload.no_rapid_upload);
        assert_eq!(config.persistence.session_ttl_hours, 168);
        assert_eq!(config.log.level, "info");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf/app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.all_parallel = 4;
        config.upload.is_overwrite = true;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.all_parallel, 4);
        assert!(loaded.upload.is_overwrite);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        std::fs::write(&path, "[upload]\nparallel = 3\n").unwrap();

        let loaded = AppConfig::load_from_file(path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(loaded.upload.parallel, 3);
        assert_eq!(loaded.upload.max_retry, 3);
        assert_eq!(loaded.upload.chunk_size_mb, DEFAULT_CHUNK_SIZE_MB);
    }

    #[tokio::test]
    async fn test_load_or_default_on_missing_file() {
        let config = AppConfig::load_or_default("/nonexistent/app.toml").await;
        assert_eq!(config.upload.max_retry, 3);
    }

    #[test]
    fn test_validate_chunk_size() {
        let mut upload = UploadConfig::default();
        assert!(upload.validate().is_ok());

        upload.chunk_size_mb = 0;
        assert!(upload.validate().is_err());

        upload.chunk_size_mb = MAX_CHUNK_SIZE_MB + 1;
        assert!(upload.validate().is_err());
    }

    #[test]
    fn test_to_options_normalizes() {
        let upload = UploadConfig {
            all_parallel: 0,
            parallel: 0,
            ..Default::default()
        };
        let opts = upload.to_options();
        assert_eq!(opts.all_parallel, 1);
        assert_eq!(opts.parallel, 1);
        assert_eq!(opts.chunk_size, 4 * 1024 * 1024);
    }
}
