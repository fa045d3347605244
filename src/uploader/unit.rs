// 单文件上传任务
//
// 状态流转：
//
//   Queued -> Hashing -> DedupCheck -> RapidDone -----------> Finalizing -> Done
//                                   \-> Transferring ------/
//
// 任一状态出错即结束本次运行，由执行器决定是否重试；
// 每次重试从 Queued 重新开始，校验信息和续传记录跨重试保留。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::chunk::{UploadChunk, UploadChunkManager};
use super::error::UploadError;
use super::folder::FolderCreator;
use super::options::UploadOptions;
use super::progress::{ProgressThrottler, UploadProgress};
use super::statistic::UploadStatistic;
use crate::localfile::{identity_key, remote_parent, FileDigests, LocalFileEntity};
use crate::netdisk::{ApiError, PanApi, RemoteEntry, UploadSessionRequest};
use crate::persistence::{LedgerRecord, ResumableLedger};
use crate::taskframework::{TaskInfo, TaskUnit, TaskUnitRunResult};

/// 一次运行中所有上传任务共享的对象
pub struct UploadContext {
    pub client: Arc<dyn PanApi>,
    pub ledger: Arc<ResumableLedger>,
    pub folders: Arc<FolderCreator>,
    pub statistic: Arc<UploadStatistic>,
    pub options: UploadOptions,
}

impl UploadContext {
    pub fn new(client: Arc<dyn PanApi>, ledger: Arc<ResumableLedger>, options: UploadOptions) -> Self {
        Self {
            folders: Arc::new(FolderCreator::new(client.clone())),
            client,
            ledger,
            statistic: Arc::new(UploadStatistic::new()),
            options: options.normalized(),
        }
    }
}

/// 单个文件的上传结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 秒传完成
    Rapid(RemoteEntry),
    /// 分片上传完成
    Uploaded(RemoteEntry),
    /// 目标已存在且未开启覆盖
    Skipped,
}

/// 上传状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStep {
    Queued,
    Hashing,
    DedupCheck,
    RapidDone { session_id: String },
    Transferring,
    Finalizing { session_id: String },
    Done(UploadOutcome),
    Failed,
}

impl fmt::Display for UploadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStep::Queued => "Queued",
            UploadStep::Hashing => "Hashing",
            UploadStep::DedupCheck => "DedupCheck",
            UploadStep::RapidDone { .. } => "RapidDone",
            UploadStep::Transferring => "Transferring",
            UploadStep::Finalizing { .. } => "Finalizing",
            UploadStep::Done(_) => "Done",
            UploadStep::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// 单个分片的失败原因
enum ChunkFailure {
    Api(ApiError),
    Local(UploadError),
}

impl ChunkFailure {
    fn into_upload_error(self) -> UploadError {
        match self {
            ChunkFailure::Api(e) => e.into(),
            ChunkFailure::Local(e) => e,
        }
    }
}

type ChunkResult = (usize, u64, Result<(), ChunkFailure>);

/// 单文件上传任务
pub struct UploadTaskUnit {
    ctx: Arc<UploadContext>,
    entity: LocalFileEntity,
    remote_path: String,
    step: UploadStep,
    task_id: u64,
    /// 本次运行是否走秒传
    rapid: bool,
    outcome: Option<UploadOutcome>,
}

impl UploadTaskUnit {
    pub fn new(ctx: Arc<UploadContext>, local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            ctx,
            entity: LocalFileEntity::new(local_path),
            remote_path: remote_path.into(),
            step: UploadStep::Queued,
            task_id: 0,
            rapid: false,
            outcome: None,
        }
    }

    pub fn local_path(&self) -> &Path {
        self.entity.local_path()
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn step(&self) -> &UploadStep {
        &self.step
    }

    /// 成功结束时的结果
    pub fn outcome(&self) -> Option<&UploadOutcome> {
        self.outcome.as_ref()
    }

    fn options(&self) -> &UploadOptions {
        &self.ctx.options
    }

    fn digests(&self) -> Result<Arc<FileDigests>, UploadError> {
        self.entity
            .cached()
            .ok_or_else(|| UploadError::TransientIo("校验信息尚未计算".to_string()))
    }

    fn session_request(&self, digests: &FileDigests) -> UploadSessionRequest {
        UploadSessionRequest {
            target_path: self.remote_path.clone(),
            size: digests.stat.size,
            content_md5: digests.full_md5.clone(),
            slice_md5s: digests.slice_md5s.clone(),
            chunk_size: digests.chunk_size,
        }
    }

    /// 执行当前状态，返回下一个状态
    async fn advance(&mut self, step: UploadStep) -> Result<UploadStep, UploadError> {
        match step {
            UploadStep::Queued => self.check_target().await,
            UploadStep::Hashing => {
                let chunk_size = self.options().effective_chunk_size();
                let digests = self
                    .entity
                    .checksum(chunk_size)
                    .await
                    .map_err(|e| UploadError::from_local_io(self.entity.local_path(), e))?;
                debug!(
                    "[{}] 校验信息: size={}, md5={}, 分片数={}",
                    self.task_id,
                    digests.stat.size,
                    digests.full_md5,
                    digests.slice_md5s.len()
                );
                Ok(UploadStep::DedupCheck)
            }
            UploadStep::DedupCheck => {
                if self.options().no_rapid_upload {
                    return Ok(UploadStep::Transferring);
                }
                let digests = self.digests()?;
                let hit = self
                    .ctx
                    .client
                    .dedup_check(digests.stat.size, &digests.full_md5)
                    .await?;
                if !hit {
                    return Ok(UploadStep::Transferring);
                }
                let session_id = self
                    .ctx
                    .client
                    .create_upload_session(&self.session_request(&digests))
                    .await?;
                Ok(UploadStep::RapidDone { session_id })
            }
            UploadStep::RapidDone { session_id } => {
                info!("[{}] 秒传命中: {}", self.task_id, self.remote_path);
                self.rapid = true;
                Ok(UploadStep::Finalizing { session_id })
            }
            UploadStep::Transferring => {
                let session_id = self.transfer().await?;
                Ok(UploadStep::Finalizing { session_id })
            }
            UploadStep::Finalizing { session_id } => self.finalize(&session_id).await,
            UploadStep::Done(outcome) => Ok(UploadStep::Done(outcome)),
            UploadStep::Failed => Err(UploadError::TransientIo("任务处于失败状态".to_string())),
        }
    }

    /// 目标已存在且不覆盖时直接跳过
    async fn check_target(&self) -> Result<UploadStep, UploadError> {
        match self.ctx.client.resolve_path(&self.remote_path).await? {
            Some(entry) if entry.is_dir => Err(UploadError::Configuration(format!(
                "目标路径是目录: {}",
                self.remote_path
            ))),
            Some(_) if !self.options().is_overwrite => self.skip_existing().await,
            _ => Ok(UploadStep::Hashing),
        }
    }

    /// 目标已存在且不覆盖：任务结束，该文件的续传记录一并删除
    async fn skip_existing(&self) -> Result<UploadStep, UploadError> {
        info!("[{}] 目标文件已存在, 跳过: {}", self.task_id, self.remote_path);
        let key = match self.entity.cached() {
            Some(digests) => Some(digests.identity_key.clone()),
            None => self
                .entity
                .stat()
                .await
                .ok()
                .map(|stat| identity_key(self.entity.local_path(), stat.size, stat.mod_time)),
        };
        if let Some(key) = key {
            if self.ctx.ledger.delete(&key)? {
                debug!("[{}] 已删除续传记录", self.task_id);
            }
        }
        Ok(UploadStep::Done(UploadOutcome::Skipped))
    }

    /// 文件被修改时作废校验信息和续传记录
    async fn ensure_unchanged(&mut self, digests: &FileDigests) -> Result<(), UploadError> {
        let changed = self
            .entity
            .has_changed()
            .await
            .map_err(|e| UploadError::from_local_io(self.entity.local_path(), e))?;
        if !changed {
            return Ok(());
        }
        warn!("[{}] 文件已被修改, 重新开始上传: {:?}", self.task_id, self.local_path());
        self.ctx.ledger.delete(&digests.identity_key)?;
        self.entity.invalidate();
        Err(UploadError::ContentChanged(self.local_path().display().to_string()))
    }

    /// 找到可续传的记录，或创建新的上传会话
    async fn open_session(&self, digests: &FileDigests) -> Result<LedgerRecord, UploadError> {
        let ledger = &self.ctx.ledger;
        let key = &digests.identity_key;

        match ledger.get(key)? {
            Some(record) if record.matches(digests.stat.size, digests.stat.mod_time, digests.chunk_size) => {
                info!(
                    "[{}] 断点续传: 已提交 {} 个分片, session={}",
                    self.task_id,
                    record.committed_count(),
                    record.session_id
                );
                return Ok(record);
            }
            Some(_) => {
                debug!("[{}] 续传记录与文件不一致, 作废", self.task_id);
                ledger.delete(key)?;
            }
            None => {}
        }
        ledger.delete_stale_for_path(&self.local_path().to_string_lossy(), key)?;

        let session_id = self
            .ctx
            .client
            .create_upload_session(&self.session_request(digests))
            .await?;
        let record = LedgerRecord::new_session(self.local_path(), digests, session_id, ledger.ttl());
        ledger.put(&record)?;
        debug!("[{}] 新建上传会话: {}", self.task_id, record.session_id);
        Ok(record)
    }

    /// 分片上传，返回会话 ID
    ///
    /// 最多 `parallel` 个分片同时上传，每个分片成功后立即写入续传记录。
    /// 第一个失败出现后不再调度新分片，等待已开始的分片结束再返回错误
    async fn transfer(&mut self) -> Result<String, UploadError> {
        let digests = self.digests()?;
        self.ensure_unchanged(&digests).await?;

        let mut record = self.open_session(&digests).await?;
        let mut manager = UploadChunkManager::new(digests.stat.size, digests.chunk_size);
        if manager.restore_committed(&record.committed_chunks) > 0 {
            debug!("[{}] 续传进度: {:.1}%", self.task_id, manager.progress());
        }

        let progress = self.options().show_progress.then(|| {
            UploadProgress::new(
                self.task_id,
                digests.stat.size,
                manager.uploaded_bytes(),
                ProgressThrottler::default(),
            )
        });

        let parallel = self.options().parallel;
        let mut join_set: JoinSet<ChunkResult> = JoinSet::new();
        let mut pending = manager.pending().into_iter();
        let mut first_error: Option<UploadError> = None;
        let mut session_lost = false;

        loop {
            // 同时进行的分片数不超过 parallel
            while first_error.is_none() && join_set.len() < parallel {
                let Some(chunk) = pending.next() else {
                    break;
                };
                let expected_md5 = digests.slice_md5s.get(chunk.index).cloned();
                let client = self.ctx.client.clone();
                let session_id = record.session_id.clone();
                let local_path = self.local_path().to_path_buf();

                join_set.spawn(async move {
                    let index = chunk.index;
                    let size = chunk.size();
                    let result =
                        upload_chunk(client, &session_id, &local_path, chunk, expected_md5).await;
                    (index, size, result)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok((index, size, Ok(()))) => {
                    record.mark_committed(index);
                    manager.mark_completed(index);
                    if let Err(e) = self.ctx.ledger.put(&record) {
                        first_error.get_or_insert(e.into());
                    }
                    if let Some(progress) = &progress {
                        progress.advance(size);
                    }
                }
                Ok((index, _, Err(failure))) => {
                    if matches!(failure, ChunkFailure::Api(ApiError::SessionExpired(_))) {
                        session_lost = true;
                    }
                    let err = failure.into_upload_error();
                    warn!("[{}] 分片 #{} 上传失败: {}", self.task_id, index, err);
                    first_error.get_or_insert(err);
                }
                Err(e) => {
                    first_error.get_or_insert(UploadError::TransientIo(format!("分片任务异常退出: {}", e)));
                }
            }
        }

        if session_lost {
            warn!("[{}] 上传会话已失效, 删除续传记录", self.task_id);
            self.ctx.ledger.delete(&record.key)?;
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if !manager.is_completed() {
            return Err(UploadError::TransientIo(format!(
                "分片未全部提交: {}/{}",
                manager.completed_count(),
                manager.chunk_count()
            )));
        }

        self.ensure_unchanged(&digests).await?;
        debug!(
            "[{}] 全部 {} 个分片已提交",
            self.task_id,
            manager.chunk_count()
        );
        Ok(record.session_id)
    }

    async fn finalize(&mut self, session_id: &str) -> Result<UploadStep, UploadError> {
        let client = &self.ctx.client;

        if let Some(existing) = client.resolve_path(&self.remote_path).await? {
            if existing.is_dir {
                return Err(UploadError::Configuration(format!(
                    "目标路径是目录: {}",
                    self.remote_path
                )));
            }
            if !self.options().is_overwrite {
                return self.skip_existing().await;
            }
            info!("[{}] 覆盖同名文件, 旧文件移入回收站: {}", self.task_id, self.remote_path);
            client.move_to_recycle_bin(&existing.file_id).await?;
        }

        self.ctx
            .folders
            .ensure_dir(&remote_parent(&self.remote_path))
            .await?;

        let digests = self.digests()?;
        let entry = match client.finalize(session_id, &self.remote_path).await {
            Ok(entry) => entry,
            Err(ApiError::SessionExpired(msg)) => {
                self.ctx.ledger.delete(&digests.identity_key)?;
                return Err(ApiError::SessionExpired(msg).into());
            }
            Err(e) => return Err(e.into()),
        };

        self.ctx.ledger.delete(&digests.identity_key)?;
        self.ctx.statistic.add_total_size(digests.stat.size);
        self.ctx.statistic.add_file(self.rapid);

        let outcome = if self.rapid {
            UploadOutcome::Rapid(entry)
        } else {
            UploadOutcome::Uploaded(entry)
        };
        Ok(UploadStep::Done(outcome))
    }
}

async fn upload_chunk(
    client: Arc<dyn PanApi>,
    session_id: &str,
    local_path: &Path,
    chunk: UploadChunk,
    expected_md5: Option<String>,
) -> Result<(), ChunkFailure> {
    let data = chunk
        .read_data(local_path)
        .await
        .map_err(|e| ChunkFailure::Local(UploadError::from_local_io(local_path, e)))?;

    let receipt = client
        .upload_chunk(session_id, chunk.index, chunk.offset(), data)
        .await
        .map_err(ChunkFailure::Api)?;

    if let Some(expected) = expected_md5 {
        if receipt.md5 != expected {
            return Err(ChunkFailure::Local(UploadError::TransientIo(format!(
                "分片 #{} 校验失败: 本地 {}, 服务端 {}",
                chunk.index, expected, receipt.md5
            ))));
        }
    }
    Ok(())
}

#[async_trait]
impl TaskUnit for UploadTaskUnit {
    type Error = UploadError;

    async fn run(&mut self, info: &TaskInfo) -> TaskUnitRunResult<UploadError> {
        self.task_id = info.id();
        self.step = UploadStep::Queued;
        self.rapid = false;

        loop {
            if let UploadStep::Done(outcome) = &self.step {
                self.outcome = Some(outcome.clone());
                return TaskUnitRunResult::success();
            }

            let current = std::mem::replace(&mut self.step, UploadStep::Failed);
            let from = current.to_string();
            match self.advance(current).await {
                Ok(next) => {
                    debug!("[{}] {} -> {}", self.task_id, from, next);
                    self.step = next;
                }
                Err(err) => {
                    debug!("[{}] {} -> Failed: {}", self.task_id, from, err);
                    return if err.is_retryable() {
                        TaskUnitRunResult::retryable(err)
                    } else {
                        TaskUnitRunResult::fatal(err)
                    };
                }
            }
        }
    }

    fn on_retry(&mut self, info: &TaskInfo, result: &TaskUnitRunResult<UploadError>) {
        if let Some(err) = &result.err {
            warn!(
                "{} 文件上传失败, 重试 {}/{}: {:?}, 错误: {}",
                info,
                info.retry(),
                info.max_retry(),
                self.local_path(),
                err
            );
        }
    }

    fn on_success(&mut self, info: &TaskInfo) {
        match &self.outcome {
            Some(UploadOutcome::Skipped) => {}
            Some(UploadOutcome::Rapid(entry)) => {
                info!("{} 秒传成功: {:?} -> {}", info, self.local_path(), entry.path)
            }
            Some(UploadOutcome::Uploaded(entry)) => {
                info!("{} 上传成功: {:?} -> {}", info, self.local_path(), entry.path)
            }
            None => {}
        }
    }

    fn on_failed(&mut self, info: &TaskInfo, result: &TaskUnitRunResult<UploadError>) {
        if let Some(err) = &result.err {
            error!("{} 文件上传失败: {:?}, 错误: {}", info, self.local_path(), err);
        }
    }
}
