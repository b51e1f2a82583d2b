// 分片上传引擎
//
// 上传流程：
// 1. 预检/秒传（由协议在 initiate 中完成，命中则直接返回）
// 2. 初始化上传会话（续传令牌 + 分片大小）
// 3. 传输分片（顺序游标模式 / 有界并发模式）
// 4. 校验分片记录后提交
// 5. 返回已提交的云端文件
//
// 并发上传策略：
// - 使用 Semaphore 控制最大并发分片数
// - 使用 JoinSet 管理并发任务，首个失败即 abort_all
// - 每个任务独立打开文件读取自己的字节范围
//
// 引擎不重试失败的分片，错误原样返回给调用方

use crate::common::ProgressTracker;
use crate::error::{CloudResult, CloudServiceError};
use crate::http::SendProgress;
use crate::provider::{CloudItem, UploadOptions, UploadResult};
use crate::uploader::chunk::{UploadPart, UploadPartManager};
use crate::uploader::session::{Initiated, LocalFile, PartAck, PartResult, UploadSession};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 服务端游标连续无进展的最大轮数
const MAX_STALLED_ROUNDS: u32 = 3;

/// 分片传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// 逐个上传，服务端可返回下一个期望偏移
    Sequential,
    /// 分片互相独立，可并发上传
    Concurrent { max_parallel: usize },
}

/// 一种服务商的分片上传协议
///
/// 引擎只负责驱动流程，请求的构造与响应解析都在协议实现中
#[async_trait]
pub trait UploadProtocol: Send + Sync {
    /// 协议名称（日志用）
    fn name(&self) -> &'static str;

    fn transfer_mode(&self) -> TransferMode;

    /// 是否允许上传空文件
    fn allows_empty_file(&self) -> bool {
        true
    }

    /// 预检 + 初始化上传会话
    async fn initiate(&self, file: &LocalFile, directory: &CloudItem) -> CloudResult<Initiated>;

    /// 上传一个分片
    ///
    /// # 参数
    /// * `session` - 当前会话（并发模式下为只读快照）
    /// * `part` - 分片号与字节范围
    /// * `data` - 分片数据，长度等于 `part.size()`
    /// * `progress` - 本分片已发送字节回调
    async fn upload_part(
        &self,
        session: &UploadSession,
        part: &UploadPart,
        data: Bytes,
        progress: SendProgress,
    ) -> CloudResult<PartAck>;

    /// 提交（合并分片），`session.parts` 已按分片号升序
    async fn commit(&self, session: &UploadSession) -> CloudResult<UploadResult>;

    /// 放弃上传（尽力而为）
    async fn abort(&self, _session: &UploadSession) -> CloudResult<()> {
        Ok(())
    }
}

/// 分片上传引擎
///
/// 每次上传创建一个引擎，会话只属于这一次上传
pub struct ChunkedUploadEngine {
    protocol: Arc<dyn UploadProtocol>,
    options: UploadOptions,
}

impl ChunkedUploadEngine {
    pub fn new(protocol: Arc<dyn UploadProtocol>, options: UploadOptions) -> Self {
        Self { protocol, options }
    }

    /// 上传本地路径指向的文件
    ///
    /// 文件不存在时返回 `UploadFileNotExist`，不产生网络请求
    pub async fn upload_path(&self, path: &Path, directory: &CloudItem) -> CloudResult<UploadResult> {
        let file = LocalFile::open(path).await?;
        self.upload(file, directory).await
    }

    /// 上传文件到指定目录
    ///
    /// # 参数
    /// * `file` - 已检查过的本地文件
    /// * `directory` - 目标目录
    ///
    /// # 返回
    /// 已提交的云端文件
    pub async fn upload(&self, file: LocalFile, directory: &CloudItem) -> CloudResult<UploadResult> {
        let protocol_name = self.protocol.name();
        if file.size == 0 && !self.protocol.allows_empty_file() {
            warn!("{} 不支持上传空文件: {:?}", protocol_name, file.path);
            return Err(CloudServiceError::Unsupported);
        }

        let cancel = self.options.cancel_token();
        if cancel.is_cancelled() {
            return Err(CloudServiceError::Cancelled);
        }

        info!(
            "开始上传: provider={}, 文件={}, 大小={} bytes, 目标目录={}",
            protocol_name,
            file.name,
            file.size,
            directory.path()
        );

        let tracker = Arc::new(ProgressTracker::new(file.size, self.options.progress.clone()));

        let mut session = match self.protocol.initiate(&file, directory).await? {
            Initiated::Completed(result) => {
                info!("✓ 秒传成功: provider={}, 文件={}", protocol_name, file.name);
                tracker.finish();
                return Ok(result);
            }
            Initiated::Session(session) => session,
        };

        info!(
            "上传会话已创建: 分片大小={} bytes, 预计分片数={}, 续传令牌={}",
            session.part_size,
            session.expected_part_count(),
            session.continuation.as_str()
        );

        let transferred = match self.protocol.transfer_mode() {
            TransferMode::Sequential => {
                self.transfer_sequential(&mut session, &tracker, &cancel)
                    .await
            }
            TransferMode::Concurrent { max_parallel } => {
                self.transfer_concurrent(&mut session, max_parallel, &tracker, &cancel)
                    .await
            }
        };

        if let Err(e) = transferred {
            self.abort_quietly(&session).await;
            return Err(e);
        }

        if cancel.is_cancelled() {
            self.abort_quietly(&session).await;
            return Err(CloudServiceError::Cancelled);
        }

        session.verify_parts()?;

        info!(
            "所有 {} 个分片上传完成，提交文件: {}",
            session.parts.len(),
            file.name
        );
        let result = self.protocol.commit(&session).await?;
        tracker.finish();

        info!(
            "✓ 上传完成: provider={}, 文件={}, id={}",
            protocol_name, result.item.name, result.item.id
        );
        Ok(result)
    }

    /// 顺序上传（游标协议）
    ///
    /// 服务端返回的偏移优先于本地计算，不一致时丢弃之后的分片记录
    async fn transfer_sequential(
        &self,
        session: &mut UploadSession,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> CloudResult<()> {
        let total = session.total_size;
        let mut offset = 0u64;
        let mut stalled_rounds = 0u32;

        // 空文件也要发送一个长度为 0 的分片
        while offset < total || session.parts.is_empty() {
            if cancel.is_cancelled() {
                info!("上传已取消，停止发送分片");
                return Err(CloudServiceError::Cancelled);
            }

            let part_number = session.parts.len() as u32 + 1;
            let part = UploadPart::at_offset(part_number, offset, session.part_size, total);
            let data = part.read_data(&session.local_file.path).await?;

            let start = part.offset();
            let progress_tracker = Arc::clone(tracker);
            let progress: SendProgress =
                Arc::new(move |sent| progress_tracker.advance_to(start + sent));

            let ack = self
                .protocol
                .upload_part(session, &part, data, progress)
                .await?;

            if cancel.is_cancelled() {
                info!("上传已取消，忽略分片 #{} 的结果", part_number);
                return Err(CloudServiceError::Cancelled);
            }

            let next = ack.next_offset.unwrap_or(part.range.end).min(total);
            let completed = ack.completed.clone();
            session.record_part(part_result(&part, ack));

            if next != part.range.end {
                warn!(
                    "服务端游标与本地不一致，重新同步: 分片 #{}, 本地={}, 服务端={}",
                    part_number, part.range.end, next
                );
                session.resync_to(next);
            }

            if next <= offset && total > 0 {
                stalled_rounds += 1;
                if stalled_rounds >= MAX_STALLED_ROUNDS {
                    return Err(CloudServiceError::ResponseDecode {
                        reason: format!("服务端游标停滞在偏移 {}", next),
                        response: None,
                    });
                }
            } else {
                stalled_rounds = 0;
            }

            if completed.is_some() {
                session.completion = completed;
            }

            offset = next;
            tracker.advance_to(offset);
            debug!("分片 #{} 已确认，当前偏移={}/{}", part_number, offset, total);
        }

        Ok(())
    }

    /// 并发上传（分片互相独立）
    async fn transfer_concurrent(
        &self,
        session: &mut UploadSession,
        max_parallel: usize,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) -> CloudResult<()> {
        let manager = UploadPartManager::new(session.total_size, session.part_size);
        let part_total = manager.part_count();
        let max_parallel = max_parallel.max(1);

        info!(
            "[并发上传] 开始上传 {} 个分片，并发数: {}",
            part_total, max_parallel
        );

        // 信号量控制并发数
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let snapshot = Arc::new(session.clone());
        let mut join_set: JoinSet<CloudResult<PartResult>> = JoinSet::new();

        for part in manager.into_parts() {
            let protocol = Arc::clone(&self.protocol);
            let semaphore = Arc::clone(&semaphore);
            let session = Arc::clone(&snapshot);
            let tracker = Arc::clone(tracker);
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| CloudServiceError::Cancelled)?;
                if cancel.is_cancelled() {
                    return Err(CloudServiceError::Cancelled);
                }

                let data = part.read_data(&session.local_file.path).await?;
                let number = part.part_number;
                let progress: SendProgress = Arc::new(move |sent| tracker.part_progress(number, sent));
                let ack = protocol.upload_part(&session, &part, data, progress).await?;
                debug!("[并发上传] 分片 #{} 上传成功", number);
                Ok(part_result(&part, ack))
            });
        }

        let mut results = Vec::with_capacity(part_total);
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("[并发上传] 上传已取消，中止所有分片任务");
                    join_set.abort_all();
                    return Err(CloudServiceError::Cancelled);
                }
                joined = join_set.join_next() => joined,
            };

            match joined {
                Some(Ok(Ok(part))) => results.push(part),
                Some(Ok(Err(e))) => {
                    error!("[并发上传] 分片上传失败，中止其余分片: {}", e);
                    join_set.abort_all();
                    return Err(e);
                }
                Some(Err(e)) => {
                    error!("[并发上传] 分片任务异常: {}", e);
                    join_set.abort_all();
                    return Err(CloudServiceError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("分片任务异常: {}", e),
                    )));
                }
                None => break,
            }
        }

        // 完成顺序任意，提交前按分片号排序
        for part in results {
            session.record_part(part);
        }
        info!("[并发上传] 所有 {} 个分片上传完成", part_total);
        Ok(())
    }

    async fn abort_quietly(&self, session: &UploadSession) {
        if let Err(e) = self.protocol.abort(session).await {
            warn!(
                "放弃上传会话失败（忽略）: provider={}, 错误: {}",
                self.protocol.name(),
                e
            );
        }
    }
}

fn part_result(part: &UploadPart, ack: PartAck) -> PartResult {
    PartResult {
        part_number: part.part_number,
        byte_range: part.range.clone(),
        content_digest: ack.content_digest,
        remote_etag: ack.etag,
        remote: ack.remote,
    }
}
