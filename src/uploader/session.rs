// 上传会话
//
// 一次上传从初始化到提交期间的全部状态；只属于一次上传，不在并发上传间共享

use crate::error::{CloudResult, CloudServiceError};
use crate::http::RawResponse;
use crate::provider::{CloudItem, UploadResult};
use serde_json::Value;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::warn;

/// 待上传的本地文件
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub path: PathBuf,
    /// 远端文件名
    pub name: String,
    pub size: u64,
}

impl LocalFile {
    /// 检查本地文件并读取大小，文件名取路径最后一段
    ///
    /// 文件不存在或不可读时返回 `UploadFileNotExist`，不会产生任何网络请求
    pub async fn open(path: &Path) -> CloudResult<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| CloudServiceError::UploadFileNotExist(path.to_path_buf()))?;
        Self::open_named(path, name).await
    }

    /// 使用指定远端文件名
    pub async fn open_named(path: &Path, name: impl Into<String>) -> CloudResult<Self> {
        let missing = || CloudServiceError::UploadFileNotExist(path.to_path_buf());

        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            warn!("读取上传文件信息失败: {:?}, 错误: {}", path, e);
            missing()
        })?;
        if !metadata.is_file() {
            return Err(missing());
        }
        // 确认可读
        tokio::fs::File::open(path).await.map_err(|e| {
            warn!("打开上传文件失败: {:?}, 错误: {}", path, e);
            missing()
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            name: name.into(),
            size: metadata.len(),
        })
    }
}

/// 续传令牌
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuationToken {
    /// 上传 ID（Baidu uploadid / Aliyun upload_id / OSS UploadId / Box session id）
    UploadId(String),
    /// 会话 URL（OneDrive uploadUrl / Google resumable session）
    SessionUrl(String),
    /// 对象存储目标
    ObjectStorage {
        bucket: String,
        object: String,
        upload_id: String,
    },
}

impl ContinuationToken {
    /// 令牌中的字符串值（上传 ID 或 URL）
    pub fn as_str(&self) -> &str {
        match self {
            ContinuationToken::UploadId(id) => id,
            ContinuationToken::SessionUrl(url) => url,
            ContinuationToken::ObjectStorage { upload_id, .. } => upload_id,
        }
    }
}

/// 单个分片的上传结果
#[derive(Debug, Clone, PartialEq)]
pub struct PartResult {
    /// 分片号（从 1 开始）
    pub part_number: u32,
    pub byte_range: Range<u64>,
    /// 本地计算的分片摘要（MD5 / SHA1）
    pub content_digest: Option<String>,
    /// 服务端返回的 ETag
    pub remote_etag: Option<String>,
    /// 服务端返回的分片记录（Box 等提交时需要原样带回）
    pub remote: Option<Value>,
}

/// 服务端对单个分片的确认
#[derive(Debug, Clone, Default)]
pub struct PartAck {
    pub content_digest: Option<String>,
    pub etag: Option<String>,
    pub remote: Option<Value>,
    /// 服务端给出的下一个期望偏移（游标协议）
    pub next_offset: Option<u64>,
    /// 最后一个分片的响应即为已提交文件（OneDrive / Google）
    pub completed: Option<RawResponse>,
}

/// 初始化结果
#[derive(Debug)]
pub enum Initiated {
    /// 预检命中，服务端已有相同内容（秒传）
    Completed(UploadResult),
    /// 需要传输分片
    Session(UploadSession),
}

/// 上传会话
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub local_file: LocalFile,
    pub total_size: u64,
    pub part_size: u64,
    pub target_directory: CloudItem,
    pub remote_file_id: Option<String>,
    pub continuation: ContinuationToken,
    /// 已确认的分片，提交前按分片号升序
    pub parts: Vec<PartResult>,
    /// 协议私有数据（预签名分片 URL、块列表等）
    pub extra: Value,
    /// 分片阶段已返回的提交结果
    pub completion: Option<RawResponse>,
}

impl UploadSession {
    pub fn new(
        local_file: LocalFile,
        part_size: u64,
        target_directory: CloudItem,
        continuation: ContinuationToken,
    ) -> Self {
        let total_size = local_file.size;
        Self {
            local_file,
            total_size,
            part_size,
            target_directory,
            remote_file_id: None,
            continuation,
            parts: Vec::new(),
            extra: Value::Null,
            completion: None,
        }
    }

    pub fn with_remote_file_id(mut self, id: impl Into<String>) -> Self {
        self.remote_file_id = Some(id.into());
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }

    /// 预计分片数，空文件为 1
    pub fn expected_part_count(&self) -> u32 {
        crate::uploader::chunk::part_count(self.total_size, self.part_size)
    }

    /// 记录一个分片（同号覆盖），保持升序
    pub fn record_part(&mut self, part: PartResult) {
        self.parts.retain(|p| p.part_number != part.part_number);
        let index = self
            .parts
            .partition_point(|p| p.part_number < part.part_number);
        self.parts.insert(index, part);
    }

    /// 已确认字节数
    pub fn confirmed_bytes(&self) -> u64 {
        self.parts
            .iter()
            .map(|p| p.byte_range.end - p.byte_range.start)
            .sum()
    }

    /// 按服务端游标重新同步：丢弃 `offset` 之后的分片记录
    ///
    /// 最后一个分片的结束位置对齐到 `offset`（服务端少收时截断，多收时延伸）
    pub fn resync_to(&mut self, offset: u64) {
        self.parts.retain(|p| p.byte_range.start < offset);
        if let Some(last) = self.parts.last_mut() {
            last.byte_range.end = offset;
        }
    }

    /// 检查分片号连续且覆盖 [0, total)
    pub fn verify_parts(&self) -> CloudResult<()> {
        let mut expected_start = 0u64;
        for (index, part) in self.parts.iter().enumerate() {
            if part.part_number as usize != index + 1 || part.byte_range.start != expected_start {
                return Err(CloudServiceError::ResponseDecode {
                    reason: format!(
                        "分片记录不连续: 第 {} 个分片号={}, 起始={}, 期望起始={}",
                        index + 1,
                        part.part_number,
                        part.byte_range.start,
                        expected_start
                    ),
                    response: None,
                });
            }
            expected_start = part.byte_range.end;
        }
        if expected_start != self.total_size || self.parts.is_empty() {
            return Err(CloudServiceError::ResponseDecode {
                reason: format!(
                    "分片未覆盖整个文件: 已覆盖={}, 文件大小={}",
                    expected_start, self.total_size
                ),
                response: None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn part(number: u32, range: Range<u64>) -> PartResult {
        PartResult {
            part_number: number,
            byte_range: range,
            content_digest: None,
            remote_etag: None,
            remote: None,
        }
    }

    fn session(total: u64) -> UploadSession {
        let file = LocalFile {
            path: PathBuf::from("/tmp/a.bin"),
            name: "a.bin".to_string(),
            size: total,
        };
        UploadSession::new(
            file,
            10,
            CloudItem::new("root", "root", "/", true),
            ContinuationToken::UploadId("u1".to_string()),
        )
    }

    #[test]
    fn test_record_part_keeps_order() {
        let mut s = session(25);
        s.record_part(part(3, 20..25));
        s.record_part(part(1, 0..10));
        s.record_part(part(2, 10..20));
        let numbers: Vec<u32> = s.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(s.verify_parts().is_ok());
        assert_eq!(s.confirmed_bytes(), 25);
    }

    #[test]
    fn test_verify_detects_gap() {
        let mut s = session(25);
        s.record_part(part(1, 0..10));
        s.record_part(part(3, 20..25));
        assert!(s.verify_parts().is_err());
    }

    #[test]
    fn test_resync_truncates_partial_part() {
        let mut s = session(30);
        s.record_part(part(1, 0..10));
        s.record_part(part(2, 10..20));
        // 服务端只收到 15 字节
        s.resync_to(15);
        assert_eq!(s.parts.len(), 2);
        assert_eq!(s.parts[1].byte_range, 10..15);

        s.resync_to(10);
        assert_eq!(s.parts.len(), 1);
        assert_eq!(s.parts[0].byte_range, 0..10);
    }

    #[tokio::test]
    async fn test_local_file_missing() {
        let err = LocalFile::open(Path::new("/definitely/not/here.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudServiceError::UploadFileNotExist(_)));
    }

    #[tokio::test]
    async fn test_local_file_size_and_name() {
        use std::io::Write;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let local = LocalFile::open_named(file.path(), "greeting.txt").await.unwrap();
        assert_eq!(local.size, 5);
        assert_eq!(local.name, "greeting.txt");
    }
}
