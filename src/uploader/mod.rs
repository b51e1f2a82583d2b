// 上传引擎模块
//
// - chunk: 分片划分与按范围读取
// - rapid_upload: 秒传哈希与分片摘要
// - session: 单次上传的会话状态
// - engine: 分片上传状态机（顺序游标 / 有界并发）
// - oss: 对象存储分片上传（HMAC 签名）

pub mod chunk;
pub mod engine;
pub mod oss;
pub mod rapid_upload;
pub mod session;

pub use chunk::{part_count, UploadPart, UploadPartManager, DEFAULT_PART_SIZE};
pub use engine::{ChunkedUploadEngine, TransferMode, UploadProtocol};
pub use oss::{
    ObjectStorageMultipartClient, OssCallback, OssCredential, OssSigner, OssTarget,
    DEFAULT_OSS_PARALLEL, DEFAULT_OSS_PART_SIZE,
};
pub use rapid_upload::{RapidUploadChecker, RapidUploadHash};
pub use session::{
    ContinuationToken, Initiated, LocalFile, PartAck, PartResult, UploadSession,
};
