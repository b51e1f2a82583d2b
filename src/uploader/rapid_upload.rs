// 秒传与内容校验哈希
//
// 秒传原理：
// 1. 计算文件的完整哈希（MD5 / SHA1）以及前若干字节的哈希
// 2. 在初始化上传时发送给服务器
// 3. 如果服务器已有相同文件，则直接完成上传（秒传成功）
//
// 分片级摘要（Box 的 Digest 头、123云盘的 sliceMD5 等）也在这里计算

use crate::error::{CloudResult, CloudServiceError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::Context as Md5Context;
use sha1::{Digest, Sha1};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// 秒传所需的哈希信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RapidUploadHash {
    /// 文件完整 MD5（小写十六进制）
    pub content_md5: String,
    /// 文件前 256KB MD5
    pub slice_md5: String,
    /// 文件完整 SHA1（大写十六进制）
    pub content_sha1: String,
    /// 文件前 1KB SHA1（小写十六进制）
    pub pre_hash: String,
    /// 文件前 128KB SHA1（大写十六进制）
    pub head_sha1: String,
    /// 文件大小
    pub file_size: u64,
}

/// 秒传检查器
pub struct RapidUploadChecker;

impl RapidUploadChecker {
    /// 前 256KB
    const SLICE_SIZE: usize = 256 * 1024;
    /// 前 1KB
    const PRE_HASH_SIZE: usize = 1024;
    /// 前 128KB
    const HEAD_SIZE: usize = 128 * 1024;

    /// 计算文件的秒传哈希值
    ///
    /// # 参数
    /// * `path` - 本地文件路径
    ///
    /// # 返回
    /// 秒传所需的哈希信息
    pub async fn calculate_hash(path: &Path) -> CloudResult<RapidUploadHash> {
        let path = path.to_path_buf();

        // 在阻塞线程池中执行文件 I/O
        run_blocking(move || Self::calculate_hash_sync(&path)).await
    }

    /// 同步计算文件哈希（单次顺序读取）
    fn calculate_hash_sync(path: &Path) -> CloudResult<RapidUploadHash> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);

        let mut full_md5 = Md5Context::new();
        let mut slice_md5 = Md5Context::new();
        let mut full_sha1 = Sha1::new();
        let mut pre_sha1 = Sha1::new();
        let mut head_sha1 = Sha1::new();
        let mut read_total: usize = 0;
        let mut buffer = [0u8; 65536]; // 64KB 缓冲区

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            let chunk = &buffer[..bytes_read];

            full_md5.consume(chunk);
            full_sha1.update(chunk);

            for (hasher_limit, feed) in [
                (Self::SLICE_SIZE, 0usize),
                (Self::PRE_HASH_SIZE, 1),
                (Self::HEAD_SIZE, 2),
            ] {
                if read_total < hasher_limit {
                    let take = bytes_read.min(hasher_limit - read_total);
                    match feed {
                        0 => slice_md5.consume(&chunk[..take]),
                        1 => pre_sha1.update(&chunk[..take]),
                        _ => head_sha1.update(&chunk[..take]),
                    }
                }
            }
            read_total += bytes_read;
        }

        let hash = RapidUploadHash {
            content_md5: format!("{:x}", full_md5.compute()),
            slice_md5: format!("{:x}", slice_md5.compute()),
            content_sha1: hex::encode_upper(full_sha1.finalize()),
            pre_hash: hex::encode(pre_sha1.finalize()),
            head_sha1: hex::encode_upper(head_sha1.finalize()),
            file_size,
        };

        debug!(
            "文件哈希计算完成: path={:?}, size={}, content_md5={}, content_sha1={}",
            path, file_size, hash.content_md5, hash.content_sha1
        );

        Ok(hash)
    }

    /// 计算分块 MD5 列表（百度 precreate 的 block_list）
    ///
    /// 空文件返回空文件本身的 MD5
    pub async fn calculate_block_list(path: &Path, block_size: u64) -> CloudResult<Vec<String>> {
        let path = path.to_path_buf();
        run_blocking(move || Self::calculate_block_list_sync(&path, block_size)).await
    }

    fn calculate_block_list_sync(path: &Path, block_size: u64) -> CloudResult<Vec<String>> {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let block_size = block_size.max(1) as usize;

        let mut blocks = Vec::new();
        let mut hasher = Md5Context::new();
        let mut in_block = 0usize;
        let mut buffer = [0u8; 65536];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            let mut consumed = 0;
            while consumed < bytes_read {
                let take = (bytes_read - consumed).min(block_size - in_block);
                hasher.consume(&buffer[consumed..consumed + take]);
                consumed += take;
                in_block += take;
                if in_block == block_size {
                    let finished = std::mem::replace(&mut hasher, Md5Context::new());
                    blocks.push(format!("{:x}", finished.compute()));
                    in_block = 0;
                }
            }
        }

        if in_block > 0 || blocks.is_empty() {
            blocks.push(format!("{:x}", hasher.compute()));
        }

        debug!("分块 MD5 计算完成: path={:?}, 块数={}", path, blocks.len());
        Ok(blocks)
    }

    /// 文件指定闭区间 `[start, end]` 的 SHA1（大写十六进制），115 二次校验使用
    pub async fn calculate_range_sha1(path: &Path, start: u64, end: u64) -> CloudResult<String> {
        let path = path.to_path_buf();
        run_blocking(move || {
            let mut file = std::fs::File::open(&path)?;
            let file_size = file.metadata()?.len();
            if start > end || end >= file_size {
                return Err(CloudServiceError::ResponseDecode {
                    reason: format!("校验区间越界: {}-{}, 文件大小 {}", start, end, file_size),
                    response: None,
                });
            }
            file.seek(SeekFrom::Start(start))?;
            let mut buffer = vec![0u8; (end - start + 1) as usize];
            file.read_exact(&mut buffer)?;
            Ok(hex::encode_upper(Sha1::digest(&buffer)))
        })
        .await
    }

    /// 阿里云盘 proof_code
    ///
    /// md5(access_token) 前 16 位十六进制转 u64 后对文件大小取模得到起点，
    /// 读取起点开始最多 8 字节并 base64
    pub async fn calculate_proof_code(
        path: &Path,
        file_size: u64,
        access_token: &str,
    ) -> CloudResult<String> {
        if file_size == 0 {
            return Ok(String::new());
        }
        let token_md5 = md5_hex(access_token.as_bytes());
        let start = u64::from_str_radix(&token_md5[..16], 16).unwrap_or(0) % file_size;
        let end = std::cmp::min(start + 8, file_size);

        let path = path.to_path_buf();
        run_blocking(move || {
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(start))?;
            let mut buffer = vec![0u8; (end - start) as usize];
            file.read_exact(&mut buffer)?;
            Ok(BASE64.encode(&buffer))
        })
        .await
    }
}

/// MD5 小写十六进制
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// SHA1 小写十六进制
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// SHA1 的 base64（Box Digest 头）
pub fn sha1_base64(data: &[u8]) -> String {
    BASE64.encode(Sha1::digest(data))
}

/// 在阻塞线程池中执行文件读取
async fn run_blocking<T, F>(task: F) -> CloudResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CloudResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|e| {
        CloudServiceError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("计算哈希任务执行失败: {}", e),
        ))
    })?
}

/// 对整个文件计算 SHA1（base64，Box 提交时的 Digest）
pub async fn file_sha1_base64(path: &Path) -> CloudResult<String> {
    let path = path.to_path_buf();
    run_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Sha1::new();
        let mut buffer = [0u8; 65536];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(BASE64.encode(hasher.finalize()))
    })
    .await
}
