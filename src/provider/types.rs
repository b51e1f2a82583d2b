// provider 公共数据类型

use crate::common::ProgressHandler;
use crate::http::RawResponse;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use tokio_util::sync::CancellationToken;

/// 云端文件/文件夹
///
/// 相等性只比较 (id, name, path, is_directory)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudItem {
    pub id: String,
    pub name: String,
    path: String,
    pub is_directory: bool,
    /// 文件大小，未知或文件夹为 -1
    pub size: i64,
    pub creation_time: Option<DateTime<Utc>>,
    pub modification_time: Option<DateTime<Utc>>,
    /// 服务端内容哈希（文件夹为 None）
    pub content_hash: Option<String>,
    /// 原始 JSON
    pub raw_attributes: Value,
    #[serde(skip)]
    path_fixed: bool,
}

impl CloudItem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<String>,
        is_directory: bool,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            is_directory,
            size: -1,
            creation_time: None,
            modification_time: None,
            content_hash: None,
            raw_attributes: Value::Null,
            path_fixed: false,
        }
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn with_hash(mut self, hash: Option<String>) -> Self {
        self.content_hash = hash;
        self
    }

    pub fn with_times(
        mut self,
        creation: Option<DateTime<Utc>>,
        modification: Option<DateTime<Utc>>,
    ) -> Self {
        self.creation_time = creation;
        self.modification_time = modification;
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw_attributes = raw;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// 列目录时用父目录路径补全路径，只生效一次
    pub fn fix_path(&mut self, parent: &CloudItem) {
        if self.path_fixed {
            return;
        }
        self.path = join_path(&parent.path, &self.name);
        self.path_fixed = true;
    }

    /// 已知完整路径时直接指定（之后 fix_path 不再生效）
    pub(crate) fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self.path_fixed = true;
        self
    }

    /// 原始 JSON 中的字符串字段
    pub fn raw_str(&self, key: &str) -> Option<&str> {
        self.raw_attributes.get(key).and_then(Value::as_str)
    }
}

impl PartialEq for CloudItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.path == other.path
            && self.is_directory == other.is_directory
    }
}

impl Eq for CloudItem {}

impl Hash for CloudItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.name.hash(state);
        self.path.hash(state);
        self.is_directory.hash(state);
    }
}

/// 拼接远端路径
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// 当前账号信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudUser {
    pub username: String,
    pub raw_attributes: Value,
}

/// 空间使用情况（字节）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSpaceInformation {
    pub total_space: i64,
    pub available_space: i64,
    pub raw_attributes: Value,
}

/// 下载请求：直链与必须携带的请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// 上传选项
#[derive(Clone, Default)]
pub struct UploadOptions {
    pub progress: Option<ProgressHandler>,
    pub cancel: Option<CancellationToken>,
}

impl UploadOptions {
    pub fn with_progress(mut self, progress: ProgressHandler) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone().unwrap_or_default()
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// 上传结果
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub item: CloudItem,
    /// 提交请求的原始响应
    pub response: Option<RawResponse>,
    /// 是否秒传
    pub rapid_upload: bool,
}

// ===== JSON 字段解析辅助 =====

/// RFC 3339 时间
pub(crate) fn parse_rfc3339(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Unix 秒级时间戳（数字或字符串）
pub(crate) fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let secs = json_i64(value)?;
    Utc.timestamp_opt(secs, 0).single()
}

/// `yyyy-MM-dd HH:mm:ss` 格式（按 UTC+8 解析）
pub(crate) fn parse_china_datetime(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let s = value.and_then(Value::as_str)?;
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()?;
    let offset = chrono::FixedOffset::east_opt(8 * 3600)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// 数字或数字字符串
pub(crate) fn json_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
