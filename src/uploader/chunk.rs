// 上传分片划分
//
// 分片规则：
// - 分片号从 1 开始，共 ceil(文件大小 / 分片大小) 个
// - 各分片字节范围首尾相接，恰好覆盖 [0, 文件大小)
// - 空文件只有一个长度为 0 的分片

use crate::error::CloudResult;
use bytes::Bytes;
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

/// 默认分片大小: 4MB
pub const DEFAULT_PART_SIZE: u64 = 4 * 1024 * 1024;

/// 上传分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPart {
    /// 分片号（从 1 开始）
    pub part_number: u32,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadPart {
    pub fn new(part_number: u32, range: Range<u64>) -> Self {
        Self { part_number, range }
    }

    /// 从 `offset` 开始、最长 `part_size` 的分片（游标协议按服务端偏移动态切分）
    pub fn at_offset(part_number: u32, offset: u64, part_size: u64, total_size: u64) -> Self {
        let end = std::cmp::min(offset.saturating_add(part_size), total_size);
        Self::new(part_number, offset..end.max(offset))
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn offset(&self) -> u64 {
        self.range.start
    }

    /// 是否为最后一个分片
    pub fn is_last(&self, total_size: u64) -> bool {
        self.range.end >= total_size
    }

    /// 读取分片数据
    ///
    /// 每次调用独立打开文件并定位，多个并发任务互不影响文件偏移
    ///
    /// # 参数
    /// * `file_path` - 本地文件路径
    ///
    /// # 返回
    /// 分片数据
    pub async fn read_data(&self, file_path: &Path) -> CloudResult<Bytes> {
        let chunk_size = self.size() as usize;
        if chunk_size == 0 {
            return Ok(Bytes::new());
        }

        let mut file = File::open(file_path).await?;
        file.seek(std::io::SeekFrom::Start(self.range.start)).await?;

        let mut buffer = vec![0u8; chunk_size];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.part_number,
            self.range.start,
            self.range.end - 1,
            chunk_size
        );

        Ok(Bytes::from(buffer))
    }
}

/// 分片数量，空文件为 1
pub fn part_count(total_size: u64, part_size: u64) -> u32 {
    if total_size == 0 || part_size == 0 {
        return 1;
    }
    ((total_size + part_size - 1) / part_size) as u32
}

/// 上传分片管理器
pub struct UploadPartManager {
    /// 所有分片
    parts: Vec<UploadPart>,
    /// 文件总大小
    total_size: u64,
    /// 分片大小
    part_size: u64,
}

impl UploadPartManager {
    /// 创建分片管理器
    ///
    /// # 参数
    /// * `total_size` - 文件总大小
    /// * `part_size` - 分片大小（为 0 时整个文件作为一个分片）
    pub fn new(total_size: u64, part_size: u64) -> Self {
        let part_size = if part_size == 0 {
            total_size.max(1)
        } else {
            part_size
        };
        let parts = Self::calculate_parts(total_size, part_size);

        info!(
            "创建上传分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            part_size,
            parts.len()
        );
        Self {
            parts,
            total_size,
            part_size,
        }
    }

    /// 计算分片
    fn calculate_parts(total_size: u64, part_size: u64) -> Vec<UploadPart> {
        if total_size == 0 {
            return vec![UploadPart::new(1, 0..0)];
        }

        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1;

        while offset < total_size {
            let end = std::cmp::min(offset + part_size, total_size);
            parts.push(UploadPart::new(part_number, offset..end));
            offset = end;
            part_number += 1;
        }

        parts
    }

    /// 获取所有分片
    pub fn parts(&self) -> &[UploadPart] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<UploadPart> {
        self.parts
    }

    /// 获取分片数量
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_part_calculation() {
        // 25MB 文件，10MB 分片 -> 10, 10, 5
        let manager = UploadPartManager::new(25 * MIB, 10 * MIB);
        let sizes: Vec<u64> = manager.parts().iter().map(|p| p.size()).collect();
        assert_eq!(sizes, vec![10 * MIB, 10 * MIB, 5 * MIB]);
        let numbers: Vec<u32> = manager.parts().iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(part_count(25 * MIB, 10 * MIB), 3);
    }

    #[test]
    fn test_exact_multiple() {
        let manager = UploadPartManager::new(20 * MIB, 10 * MIB);
        assert_eq!(manager.part_count(), 2);
        assert_eq!(manager.parts()[1].range, 10 * MIB..20 * MIB);
    }

    #[test]
    fn test_empty_file_single_part() {
        let manager = UploadPartManager::new(0, DEFAULT_PART_SIZE);
        assert_eq!(manager.parts(), &[UploadPart::new(1, 0..0)]);
        assert_eq!(part_count(0, DEFAULT_PART_SIZE), 1);
    }

    #[test]
    fn test_at_offset_clamps_to_total() {
        let part = UploadPart::at_offset(3, 20, 10, 25);
        assert_eq!(part.range, 20..25);
        assert!(part.is_last(25));
    }

    #[tokio::test]
    async fn test_read_data_at_offset() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"0123456789abcdef").unwrap();

        let part = UploadPart::new(2, 10..16);
        let data = part.read_data(file.path()).await.unwrap();
        assert_eq!(&data[..], b"abcdef");

        let empty = UploadPart::new(1, 0..0);
        assert!(empty.read_data(file.path()).await.unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_parts_cover_file_exactly(total in 0u64..10_000_000, part_size in 1u64..3_000_000) {
            let manager = UploadPartManager::new(total, part_size);
            let parts = manager.parts();

            prop_assert_eq!(parts.len() as u32, part_count(total, part_size));
            let mut expected_start = 0u64;
            for (index, part) in parts.iter().enumerate() {
                prop_assert_eq!(part.part_number as usize, index + 1);
                prop_assert_eq!(part.range.start, expected_start);
                prop_assert!(part.size() <= part_size);
                expected_start = part.range.end;
            }
            prop_assert_eq!(expected_start, total);
        }
    }
}
