// HTTP 请求/响应描述
//
// provider 只构造请求描述，由 RequestPipeline 负责注入凭证并发送

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// 请求体发送进度回调（参数为本请求已发送字节数）
pub type SendProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// 请求体
#[derive(Debug, Clone)]
pub enum HttpBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    Bytes(Bytes),
    /// 发送时从磁盘按块读取
    File { path: PathBuf, len: u64 },
    Multipart(MultipartBody),
}

impl HttpBody {
    /// 请求体中的原始字节长度（仅 Bytes/File/Multipart 文件部分）
    pub fn payload_len(&self) -> u64 {
        match self {
            HttpBody::Bytes(data) => data.len() as u64,
            HttpBody::File { len, .. } => *len,
            HttpBody::Multipart(form) => form.file.as_ref().map_or(0, |f| f.data.len()),
            _ => 0,
        }
    }
}

/// 上传内容：内存中的字节，或只记录路径与长度的本地文件
#[derive(Debug, Clone)]
pub enum BodyData {
    Bytes(Bytes),
    File { path: PathBuf, len: u64 },
}

impl BodyData {
    pub fn file(path: impl Into<PathBuf>, len: u64) -> Self {
        BodyData::File {
            path: path.into(),
            len,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            BodyData::Bytes(data) => data.len() as u64,
            BodyData::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for BodyData {
    fn from(data: Bytes) -> Self {
        BodyData::Bytes(data)
    }
}

impl From<BodyData> for HttpBody {
    fn from(data: BodyData) -> Self {
        match data {
            BodyData::Bytes(data) => HttpBody::Bytes(data),
            BodyData::File { path, len } => HttpBody::File { path, len },
        }
    }
}

/// multipart/form-data 请求体
#[derive(Debug, Clone, Default)]
pub struct MultipartBody {
    pub fields: Vec<(String, String)>,
    pub file: Option<FilePart>,
}

/// multipart 中的文件字段
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub data: BodyData,
}

impl MultipartBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn file(
        mut self,
        field: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<BodyData>,
    ) -> Self {
        self.file = Some(FilePart {
            field: field.into(),
            file_name: file_name.into(),
            data: data.into(),
        });
        self
    }
}

/// 一次逻辑 HTTP 操作的描述
#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: HttpBody,
    /// 是否由管线注入凭证（预签名 URL、OSS 自签名请求为 false）
    pub authorize: bool,
    pub progress: Option<SendProgress>,
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("authorize", &self.authorize)
            .finish()
    }
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: HttpBody::Empty,
            authorize: true,
            progress: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// 设置请求头（同名覆盖，大小写不敏感）
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = HttpBody::Json(value);
        self
    }

    pub fn form<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = HttpBody::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn bytes(mut self, data: Bytes) -> Self {
        self.body = HttpBody::Bytes(data);
        self
    }

    /// 任意请求体（本地文件上传时为流式 File）
    pub fn with_body(mut self, body: impl Into<HttpBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn multipart(mut self, form: MultipartBody) -> Self {
        self.body = HttpBody::Multipart(form);
        self
    }

    /// 不注入凭证
    pub fn unauthenticated(mut self) -> Self {
        self.authorize = false;
        self
    }

    pub fn on_progress(mut self, progress: SendProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// 带查询串的完整 URL
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, query)
    }
}

/// 传输成功后的原始响应
#[derive(Debug, Clone)]
pub struct RawResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
}

impl RawResponse {
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// 以 JSON 值构造响应
    pub fn from_json(status: u16, value: &Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self::new(status, headers, value.to_string().into_bytes())
    }

    /// 追加响应头，名称或值非法时忽略
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// 按 JSON 解析响应体，非 JSON 返回 None
    pub fn json(&self) -> Option<Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }
}
