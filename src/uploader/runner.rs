//! 批量上传入口
//!
//! 展开本地路径 -> 每个文件一个上传任务 -> 交给执行器 -> 汇总结果

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::UploadError;
use super::options::UploadOptions;
use super::progress::format_bytes;
use super::unit::{UploadContext, UploadTaskUnit};
use crate::config::AppConfig;
use crate::localfile::{clean_remote_path, scan_root_async, ScanOptions};
use crate::netdisk::PanApi;
use crate::persistence::ResumableLedger;
use crate::taskframework::{TaskExecutor, TaskInfoItem};

/// 已加入队列的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedFile {
    pub id: u64,
    pub local_path: PathBuf,
    pub remote_path: String,
}

/// 无法展开的本地路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedPath {
    pub local_path: PathBuf,
    pub reason: String,
}

/// 最终失败（或未执行）的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    pub id: u64,
    pub local_path: PathBuf,
    pub error: Option<String>,
}

impl From<TaskInfoItem<UploadTaskUnit>> for FailedFile {
    fn from(item: TaskInfoItem<UploadTaskUnit>) -> Self {
        Self {
            id: item.info.id(),
            local_path: item.unit.local_path().to_path_buf(),
            error: item.err.map(|e| e.to_string()),
        }
    }
}

/// 一次批量上传的结果
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub admitted: Vec<AdmittedFile>,
    pub rejected: Vec<RejectedPath>,
    /// 按最终失败的先后顺序
    pub failed: Vec<FailedFile>,
    /// 停止后未执行的文件
    pub cancelled: Vec<FailedFile>,
    pub total_size: u64,
    pub elapsed: Duration,
    /// 上传成功（含秒传）的文件数
    pub file_count: usize,
    pub rapid_count: usize,
    /// 执行期间的重试次数
    pub retries: usize,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty() && self.rejected.is_empty()
    }
}

impl fmt::Display for UploadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.admitted.is_empty() {
            return writeln!(f, "未检测到上传的文件.");
        }
        writeln!(
            f,
            "上传结束, 时间: {:?}, 总大小: {}, 文件数: {} (秒传 {})",
            Duration::from_millis(self.elapsed.as_millis() as u64),
            format_bytes(self.total_size),
            self.file_count,
            self.rapid_count
        )?;
        if !self.failed.is_empty() {
            writeln!(f, "以下文件上传失败:")?;
            for item in &self.failed {
                write!(f, "  [{}]  {}", item.id, item.local_path.display())?;
                match &item.error {
                    Some(err) => writeln!(f, "  {}", err)?,
                    None => writeln!(f)?,
                }
            }
        }
        if !self.cancelled.is_empty() {
            writeln!(f, "以下文件未上传:")?;
            for item in &self.cancelled {
                writeln!(f, "  [{}]  {}", item.id, item.local_path.display())?;
            }
        }
        for rejected in &self.rejected {
            writeln!(f, "警告: 遍历错误: {}: {}", rejected.local_path.display(), rejected.reason)?;
        }
        Ok(())
    }
}

/// 批量上传
pub async fn run_upload(
    client: Arc<dyn PanApi>,
    ledger: Arc<ResumableLedger>,
    local_paths: &[PathBuf],
    save_path: &str,
    options: UploadOptions,
) -> Result<UploadReport, UploadError> {
    run_upload_with_stop(
        client,
        ledger,
        local_paths,
        save_path,
        options,
        CancellationToken::new(),
    )
    .await
}

/// 批量上传，`stop` 取消后不再开始新的文件
pub async fn run_upload_with_stop(
    client: Arc<dyn PanApi>,
    ledger: Arc<ResumableLedger>,
    local_paths: &[PathBuf],
    save_path: &str,
    options: UploadOptions,
    stop: CancellationToken,
) -> Result<UploadReport, UploadError> {
    if local_paths.is_empty() {
        return Err(UploadError::Configuration("本地路径为空".to_string()));
    }

    let options = options.normalized();
    let save_path = clean_remote_path(save_path);
    match client.resolve_path(&save_path).await {
        Ok(Some(entry)) if !entry.is_dir => {
            warn!("上传文件, 云盘路径 {} 不是目录", save_path)
        }
        Ok(_) => {}
        Err(e) => warn!("上传文件, 获取云盘路径 {} 错误, {}", save_path, e),
    }

    let max_retry = options.max_retry;
    let mut executor = TaskExecutor::with_stop_token(stop);
    executor.set_parallel(options.all_parallel);
    let ctx = Arc::new(UploadContext::new(client, ledger, options));
    let mut report = UploadReport::default();

    ctx.statistic.start_timer();

    for root in local_paths {
        let files = match scan_root_async(root.clone(), save_path.clone(), ScanOptions::default()).await {
            Ok(files) => files,
            Err(e) => {
                warn!("遍历错误: {:?}, {:#}", root, e);
                report.rejected.push(RejectedPath {
                    local_path: root.clone(),
                    reason: format!("{:#}", e),
                });
                continue;
            }
        };

        for file in files {
            let unit = UploadTaskUnit::new(ctx.clone(), &file.local_path, &file.remote_path);
            let task = executor.append(unit, max_retry);
            info!("{} 加入上传队列: {}", task, file.local_path.display());
            report.admitted.push(AdmittedFile {
                id: task.id(),
                local_path: file.local_path,
                remote_path: file.remote_path,
            });
        }
    }

    if executor.count() == 0 {
        info!("未检测到上传的文件");
        return Ok(report);
    }

    executor.execute().await;

    report.failed = executor.failed_deque().into_iter().map(FailedFile::from).collect();
    for lost in executor.lost_deque() {
        let local_path = report
            .admitted
            .iter()
            .find(|a| a.id == lost.info.id())
            .map(|a| a.local_path.clone())
            .unwrap_or_default();
        report.failed.push(FailedFile {
            id: lost.info.id(),
            local_path,
            error: Some(format!("任务异常退出: {}", lost.reason)),
        });
    }
    report.cancelled = executor
        .cancelled_deque()
        .into_iter()
        .map(FailedFile::from)
        .collect();
    report.total_size = ctx.statistic.total_size();
    report.elapsed = ctx.statistic.elapsed();
    report.file_count = ctx.statistic.file_count();
    report.rapid_count = ctx.statistic.rapid_count();
    report.retries = executor.retry_total();

    info!(
        "上传结束, 时间: {:?}, 总大小: {}, 失败 {} 个",
        report.elapsed,
        format_bytes(report.total_size),
        report.failed.len()
    );
    Ok(report)
}

/// 按配置打开续传记录库并执行批量上传，结束后关闭记录库
pub async fn run_upload_with_config(
    client: Arc<dyn PanApi>,
    config: &AppConfig,
    local_paths: &[PathBuf],
    save_path: &str,
) -> anyhow::Result<UploadReport> {
    config.upload.validate()?;
    let ledger = Arc::new(
        ResumableLedger::open(&config.persistence.ledger_path, config.persistence.session_ttl())
            .context("打开上传未完成数据库错误")?,
    );

    let result = run_upload(
        client,
        ledger.clone(),
        local_paths,
        save_path,
        config.upload.to_options(),
    )
    .await;

    ledger.close().context("关闭上传未完成数据库错误")?;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdisk::{ApiError, ChunkReceipt, MemoryPanClient, RemoteEntry, UploadSessionRequest};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        client: Arc<MemoryPanClient>,
        ledger: Arc<ResumableLedger>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let ledger = Arc::new(
                ResumableLedger::open(&dir.path().join("data/uploading.db"), Duration::from_secs(3600))
                    .unwrap(),
            );
            Self {
                dir,
                client: Arc::new(MemoryPanClient::new()),
                ledger,
            }
        }

        fn write(&self, rel: &str, content: &[u8]) -> PathBuf {
            let path = self.dir.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, content).unwrap();
            path
        }

        async fn run(&self, paths: &[PathBuf], save: &str, options: UploadOptions) -> UploadReport {
            run_upload(self.client.clone(), self.ledger.clone(), paths, save, options)
                .await
                .unwrap()
        }
    }

    fn chunked(chunk_size: u64) -> UploadOptions {
        UploadOptions {
            chunk_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_empty_file_uploads_without_chunks() {
        let fx = Fixture::new();
        let path = fx.write("empty.txt", b"");

        let report = fx
            .run(&[path], "/dst", UploadOptions { max_retry: 3, ..chunked(4) })
            .await;

        assert!(report.is_success(), "{}", report);
        assert_eq!(report.file_count, 1);
        assert_eq!(report.total_size, 0);
        assert_eq!(fx.client.calls().upload_chunk, 0);
        assert_eq!(fx.client.entry("/dst/empty.txt").unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_one_chunk_failure_retried_once() {
        let fx = Fixture::new();
        let path = fx.write("three.bin", b"aaaabbbbcc");
        fx.client.inject_chunk_failures(1, 1);

        let report = fx.run(&[path.clone()], "/dst", chunked(4)).await;

        assert!(report.is_success(), "{}", report);
        assert_eq!(report.total_size, 10);
        assert_eq!(report.retries, 1);
        assert!(fx.ledger.is_empty().unwrap());
        // 第 1 次: #0 成功, #1 失败；第 2 次只补传 #1 #2
        assert_eq!(fx.client.calls().upload_chunk, 4);
    }

    #[tokio::test]
    async fn test_two_roots_same_target_leave_no_ledger_record() {
        let fx = Fixture::new();
        fx.client.set_latency(Duration::from_millis(10));
        fx.write("p/same/f.txt", b"first copy!!");
        fx.write("q/same/f.txt", b"second copy!");

        let report = fx
            .run(
                &[fx.dir.path().join("p/same"), fx.dir.path().join("q/same")],
                "/dst",
                UploadOptions {
                    all_parallel: 2,
                    ..chunked(4)
                },
            )
            .await;

        assert_eq!(report.admitted.len(), 2);
        assert!(report.failed.is_empty(), "{}", report);
        assert_eq!(report.file_count, 1);
        assert!(fx.client.entry("/dst/same/f.txt").is_some());
        assert_eq!(fx.ledger.len().unwrap(), 0);
    }

    /// 秒传检查时 panic 的网盘
    struct CrashingClient(MemoryPanClient);

    #[async_trait::async_trait]
    impl PanApi for CrashingClient {
        async fn resolve_path(&self, path: &str) -> Result<Option<RemoteEntry>, ApiError> {
            self.0.resolve_path(path).await
        }

        async fn dedup_check(&self, _size: u64, _content_md5: &str) -> Result<bool, ApiError> {
            panic!("秒传接口崩溃");
        }

        async fn create_upload_session(&self, req: &UploadSessionRequest) -> Result<String, ApiError> {
            self.0.create_upload_session(req).await
        }

        async fn upload_chunk(
            &self,
            session_id: &str,
            index: usize,
            offset: u64,
            data: Vec<u8>,
        ) -> Result<ChunkReceipt, ApiError> {
            self.0.upload_chunk(session_id, index, offset, data).await
        }

        async fn finalize(&self, session_id: &str, target_path: &str) -> Result<RemoteEntry, ApiError> {
            self.0.finalize(session_id, target_path).await
        }

        async fn move_to_recycle_bin(&self, file_id: &str) -> Result<(), ApiError> {
            self.0.move_to_recycle_bin(file_id).await
        }

        async fn create_directory(&self, path: &str) -> Result<RemoteEntry, ApiError> {
            self.0.create_directory(path).await
        }
    }

    #[tokio::test]
    async fn test_panicked_file_reported_as_failed() {
        let fx = Fixture::new();
        let path = fx.write("boom.txt", b"boom");
        let client = Arc::new(CrashingClient(MemoryPanClient::new()));

        let report = run_upload(client, fx.ledger.clone(), &[path.clone()], "/dst", chunked(4))
            .await
            .unwrap();

        assert_eq!(report.admitted.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, 1);
        assert_eq!(report.failed[0].local_path, report.admitted[0].local_path);
        assert!(report.failed[0].error.as_deref().unwrap().contains("任务异常退出"));
        assert_eq!(report.file_count, 0);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_same_new_directory_created_once() {
        let fx = Fixture::new();
        fx.client.set_latency(Duration::from_millis(10));
        fx.write("pair/x.txt", b"xxxxxxxx");
        fx.write("pair/y.txt", b"yyyyyyyyyy");

        let report = fx
            .run(
                &[fx.dir.path().join("pair")],
                "/dst",
                UploadOptions {
                    all_parallel: 2,
                    ..chunked(4)
                },
            )
            .await;

        assert!(report.is_success(), "{}", report);
        assert_eq!(report.admitted.len(), 2);
        assert_eq!(fx.client.calls().create_directory, 1);
        assert!(fx.client.entry("/dst/pair/x.txt").is_some());
        assert!(fx.client.entry("/dst/pair/y.txt").is_some());
    }

    #[tokio::test]
    async fn test_overwrite_recycles_existing_once() {
        let fx = Fixture::new();
        let old = fx.client.put_file("/dst/d.txt", b"old body").unwrap();
        let path = fx.write("d.txt", b"brand new body");

        let report = fx
            .run(
                &[path],
                "/dst",
                UploadOptions {
                    is_overwrite: true,
                    ..chunked(4)
                },
            )
            .await;

        assert!(report.is_success(), "{}", report);
        assert_eq!(fx.client.calls().move_to_recycle_bin, 1);
        assert_eq!(fx.client.recycle_bin(), vec![old]);
        assert_eq!(fx.client.entry("/dst/d.txt").unwrap().size, 14);
    }

    #[tokio::test]
    async fn test_identical_files_second_is_rapid() {
        let fx = Fixture::new();
        fx.write("dup/a.bin", b"12345678");
        fx.write("dup/b.bin", b"12345678");

        let report = fx.run(&[fx.dir.path().join("dup")], "/", chunked(4)).await;

        assert!(report.is_success(), "{}", report);
        assert_eq!(report.file_count, 2);
        assert_eq!(report.rapid_count, 1);
        assert_eq!(report.total_size, 16);
        assert_eq!(fx.client.calls().upload_chunk, 2);
    }

    #[tokio::test]
    async fn test_file_parallelism_bounded() {
        let fx = Fixture::new();
        fx.client.set_latency(Duration::from_millis(10));
        for i in 0..6 {
            fx.write(&format!("many/{}.txt", i), format!("content-{}", i).as_bytes());
        }

        let report = fx
            .run(
                &[fx.dir.path().join("many")],
                "/dst",
                UploadOptions {
                    all_parallel: 2,
                    ..chunked(4)
                },
            )
            .await;

        assert!(report.is_success(), "{}", report);
        assert_eq!(report.file_count, 6);
        // 两个文件同时进行，且不超过上限
        assert_eq!(fx.client.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_failed_files_reported_in_order() {
        let fx = Fixture::new();
        let path = fx.write("bad.bin", b"aaaabbbb");
        fx.client.inject_chunk_failures(0, 100);

        let report = fx
            .run(
                &[path.clone()],
                "/dst",
                UploadOptions {
                    max_retry: 1,
                    ..chunked(4)
                },
            )
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, 1);
        assert_eq!(report.failed[0].local_path, dunce::canonicalize(&path).unwrap());
        assert_eq!(report.retries, 1);
        assert_eq!(report.file_count, 0);
        // 失败的文件保留续传记录
        assert_eq!(fx.ledger.len().unwrap(), 1);

        let text = report.to_string();
        assert!(text.contains("以下文件上传失败"));
        assert!(text.contains("[1]"));
    }

    #[tokio::test]
    async fn test_missing_root_rejected_others_uploaded() {
        let fx = Fixture::new();
        let good = fx.write("ok.txt", b"fine");
        let missing = fx.dir.path().join("missing");

        let report = fx.run(&[missing.clone(), good], "/dst", chunked(4)).await;

        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].local_path, missing);
        assert_eq!(report.admitted.len(), 1);
        assert_eq!(report.admitted[0].id, 1);
        assert_eq!(report.file_count, 1);
    }

    #[tokio::test]
    async fn test_empty_input_and_empty_dir() {
        let fx = Fixture::new();
        let err = run_upload(fx.client.clone(), fx.ledger.clone(), &[], "/", UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Configuration(_)));

        let empty_dir = fx.dir.path().join("nothing");
        fs::create_dir_all(&empty_dir).unwrap();
        let report = fx.run(&[empty_dir], "/", UploadOptions::default()).await;
        assert!(report.admitted.is_empty());
        assert_eq!(report.to_string(), "未检测到上传的文件.\n");
    }

    #[tokio::test]
    async fn test_stopped_run_reports_cancelled() {
        let fx = Fixture::new();
        fx.write("stop/a.txt", b"a");
        fx.write("stop/b.txt", b"b");
        let stop = CancellationToken::new();
        stop.cancel();

        let report = run_upload_with_stop(
            fx.client.clone(),
            fx.ledger.clone(),
            &[fx.dir.path().join("stop")],
            "/dst",
            UploadOptions::default(),
            stop,
        )
        .await
        .unwrap();

        assert_eq!(report.cancelled.len(), 2);
        assert_eq!(report.file_count, 0);
        assert!(report.to_string().contains("以下文件未上传"));
    }

    #[tokio::test]
    async fn test_run_with_config_closes_ledger() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("cfg.txt");
        fs::write(&local, b"config driven").unwrap();

        let mut config = AppConfig::default();
        config.persistence.ledger_path = dir.path().join("state/uploading.db");
        config.upload.chunk_size_mb = 1;
        let client = Arc::new(MemoryPanClient::new());

        let report = run_upload_with_config(client.clone(), &config, &[local], "/cfg")
            .await
            .unwrap();
        assert_eq!(report.file_count, 1);
        assert!(config.persistence.ledger_path.exists());
        assert!(client.entry("/cfg/cfg.txt").is_some());
    }
}
