// 对象存储分片上传（OSS 兼容协议）
//
// 部分网盘（115）把文件内容交给对象存储，由网盘下发临时 STS 凭证：
// 1. POST {object}?uploads           -> 解析 <UploadId>
// 2. PUT  {object}?partNumber=N&uploadId=U  -> 记录 ETag（并发）
// 3. POST {object}?uploadId=U        -> <CompleteMultipartUpload> XML，按分片号升序
// 任一分片失败则不发送 complete，并尽力 DELETE ?uploadId=U 放弃上传
//
// 签名：base64(HMAC-SHA1(secret, VERB\nContent-MD5\nContent-Type\nDate\nCanonicalizedOSSHeaders + CanonicalizedResource))

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{HttpRequest, HttpTransport, RawResponse, SendProgress};
use crate::provider::{join_path, CloudItem, UploadOptions, UploadResult};
use crate::uploader::chunk::UploadPart;
use crate::uploader::engine::{ChunkedUploadEngine, TransferMode, UploadProtocol};
use crate::uploader::session::{
    ContinuationToken, Initiated, LocalFile, PartAck, PartResult, UploadSession,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

type HmacSha1 = Hmac<Sha1>;

/// 默认分片大小: 10MB
pub const DEFAULT_OSS_PART_SIZE: u64 = 10 * 1024 * 1024;

/// 默认并发分片数
pub const DEFAULT_OSS_PARALLEL: usize = 4;

/// 临时访问凭证（STS）
#[derive(Clone)]
pub struct OssCredential {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub security_token: Option<String>,
}

impl fmt::Debug for OssCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OssCredential")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"***")
            .field("security_token", &self.security_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// 上传完成后由对象存储回调网盘服务端
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OssCallback {
    /// 回调参数（JSON 字符串，发送前 base64）
    pub callback: String,
    pub callback_var: Option<String>,
}

/// 上传目标
#[derive(Debug, Clone)]
pub struct OssTarget {
    /// 形如 `https://oss-cn-shenzhen.aliyuncs.com` 或不带协议的主机名
    pub endpoint: String,
    pub bucket: String,
    pub object: String,
    pub callback: Option<OssCallback>,
}

impl OssTarget {
    fn host(&self) -> &str {
        let endpoint = self.endpoint.trim_end_matches('/');
        endpoint
            .strip_prefix("https://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .unwrap_or(endpoint)
    }

    /// 对象 URL（路径按段编码）
    fn object_url(&self, subresource: &str) -> String {
        let object = self
            .object
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "https://{}.{}/{}?{}",
            self.bucket,
            self.host(),
            object,
            subresource
        )
    }

    /// 参与签名的资源串
    fn resource(&self, subresource: &str) -> String {
        format!(
            "/{}/{}?{}",
            self.bucket,
            self.object.trim_start_matches('/'),
            subresource
        )
    }
}

/// OSS 请求签名
pub struct OssSigner {
    credential: OssCredential,
}

impl OssSigner {
    pub fn new(credential: OssCredential) -> Self {
        Self { credential }
    }

    /// 待签名字符串
    ///
    /// `oss_headers` 只取 `x-oss-` 前缀，名称转小写后按字典序排列
    pub fn canonical_string(
        method: &str,
        content_md5: &str,
        content_type: &str,
        date: &str,
        oss_headers: &[(String, String)],
        resource: &str,
    ) -> String {
        let mut headers: Vec<(String, String)> = oss_headers
            .iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .filter(|(k, _)| k.starts_with("x-oss-"))
            .collect();
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        format!(
            "{}\n{}\n{}\n{}\n{}{}",
            method, content_md5, content_type, date, canonical_headers, resource
        )
    }

    /// base64(HMAC-SHA1(secret, canonical))
    pub fn signature(&self, canonical: &str) -> CloudResult<String> {
        let mut mac = HmacSha1::new_from_slice(self.credential.access_key_secret.as_bytes())
            .map_err(|e| CloudServiceError::transport(format!("OSS 签名密钥无效: {}", e)))?;
        mac.update(canonical.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// 为请求加上 Date、STS 令牌与 Authorization 头
    pub fn sign(&self, request: &mut HttpRequest, resource: &str, date: &str) -> CloudResult<()> {
        request.set_header("Date", date);
        if let Some(token) = &self.credential.security_token {
            request.set_header("x-oss-security-token", token.clone());
        }

        let canonical = Self::canonical_string(
            request.method.as_str(),
            request.header_value("Content-MD5").unwrap_or(""),
            request.header_value("Content-Type").unwrap_or(""),
            date,
            &request.headers,
            resource,
        );
        let signature = self.signature(&canonical)?;
        request.set_header(
            "Authorization",
            format!("OSS {}:{}", self.credential.access_key_id, signature),
        );
        Ok(())
    }
}

/// RFC 1123 GMT 时间
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// 取出 XML 中第一个 `<tag>` 的文本
pub fn extract_xml_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(xml[start..end].trim().to_string())
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// complete 请求体，分片按分片号升序
pub fn complete_body(parts: &[PartResult]) -> CloudResult<String> {
    let mut sorted: Vec<&PartResult> = parts.iter().collect();
    sorted.sort_by_key(|p| p.part_number);

    let mut body = String::from("<CompleteMultipartUpload>");
    for part in sorted {
        let etag = part.remote_etag.as_deref().ok_or_else(|| {
            CloudServiceError::ResponseDecode {
                reason: format!("分片 #{} 缺少 ETag", part.part_number),
                response: None,
            }
        })?;
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            escape_xml(etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    Ok(body)
}

/// 非 2xx 响应转为业务错误（错误码为 HTTP 状态，消息取 XML 中的 Code/Message）
fn check_status(response: RawResponse) -> CloudResult<RawResponse> {
    if response.is_success() {
        return Ok(response);
    }
    let text = response.text();
    let message = match (extract_xml_tag(&text, "Code"), extract_xml_tag(&text, "Message")) {
        (Some(code), Some(message)) => Some(format!("{}: {}", code, message)),
        (Some(code), None) => Some(code),
        (None, message) => message,
    };
    Err(CloudServiceError::Service {
        code: response.status() as i64,
        message,
        response: Some(Box::new(response)),
    })
}

/// 对象存储分片上传客户端
pub struct ObjectStorageMultipartClient {
    transport: Arc<dyn HttpTransport>,
    signer: OssSigner,
    target: OssTarget,
    part_size: u64,
    max_parallel: usize,
}

impl ObjectStorageMultipartClient {
    pub fn new(transport: Arc<dyn HttpTransport>, credential: OssCredential, target: OssTarget) -> Self {
        Self {
            transport,
            signer: OssSigner::new(credential),
            target,
            part_size: DEFAULT_OSS_PART_SIZE,
            max_parallel: DEFAULT_OSS_PARALLEL,
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn target(&self) -> &OssTarget {
        &self.target
    }

    /// 通过分片上传引擎上传整个文件
    pub async fn upload(
        self: Arc<Self>,
        file: LocalFile,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        ChunkedUploadEngine::new(self, options)
            .upload(file, directory)
            .await
    }

    async fn send_signed(&self, request: HttpRequest, subresource: &str) -> CloudResult<RawResponse> {
        let mut request = request.unauthenticated();
        let date = http_date(Utc::now());
        self.signer
            .sign(&mut request, &self.target.resource(subresource), &date)?;
        debug!("OSS 请求: {} {}", request.method, request.url);
        let response = self.transport.send(&request).await?;
        check_status(response)
    }

    /// 初始化分片上传，返回 UploadId
    pub async fn initiate_upload(&self) -> CloudResult<String> {
        let subresource = "uploads";
        let request = HttpRequest::post(self.target.object_url(subresource));
        let response = self.send_signed(request, subresource).await?;
        match extract_xml_tag(&response.text(), "UploadId") {
            Some(upload_id) if !upload_id.is_empty() => {
                info!(
                    "OSS 分片上传已初始化: bucket={}, object={}, upload_id={}",
                    self.target.bucket, self.target.object, upload_id
                );
                Ok(upload_id)
            }
            _ => Err(CloudServiceError::decode("响应中缺少 UploadId", &response)),
        }
    }

    /// 上传一个分片，返回 ETag
    pub async fn upload_part_data(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        progress: SendProgress,
    ) -> CloudResult<String> {
        let subresource = format!("partNumber={}&uploadId={}", part_number, upload_id);
        let request = HttpRequest::put(self.target.object_url(&subresource))
            .bytes(data)
            .on_progress(progress);
        let response = self.send_signed(request, &subresource).await?;
        match response.header("ETag") {
            Some(etag) => Ok(etag.to_string()),
            None => Err(CloudServiceError::decode(
                format!("分片 #{} 响应缺少 ETag", part_number),
                &response,
            )),
        }
    }

    /// 完成分片上传
    pub async fn complete_upload(
        &self,
        upload_id: &str,
        parts: &[PartResult],
    ) -> CloudResult<RawResponse> {
        let subresource = format!("uploadId={}", upload_id);
        let body = complete_body(parts)?;
        let mut request = HttpRequest::post(self.target.object_url(&subresource))
            .header("Content-Type", "application/xml")
            .bytes(Bytes::from(body));

        if let Some(callback) = &self.target.callback {
            request = request.header("x-oss-callback", BASE64.encode(callback.callback.as_bytes()));
            if let Some(var) = &callback.callback_var {
                request = request.header("x-oss-callback-var", BASE64.encode(var.as_bytes()));
            }
        }

        self.send_signed(request, &subresource).await
    }

    /// 放弃分片上传
    pub async fn abort_upload(&self, upload_id: &str) -> CloudResult<()> {
        let subresource = format!("uploadId={}", upload_id);
        let request = HttpRequest::delete(self.target.object_url(&subresource));
        self.send_signed(request, &subresource).await?;
        info!("OSS 分片上传已放弃: upload_id={}", upload_id);
        Ok(())
    }
}

fn upload_id_of(session: &UploadSession) -> CloudResult<&str> {
    match &session.continuation {
        ContinuationToken::ObjectStorage { upload_id, .. } => Ok(upload_id),
        other => Err(CloudServiceError::ResponseDecode {
            reason: format!("会话不是对象存储上传: {:?}", other),
            response: None,
        }),
    }
}

#[async_trait]
impl UploadProtocol for ObjectStorageMultipartClient {
    fn name(&self) -> &'static str {
        "oss"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Concurrent {
            max_parallel: self.max_parallel,
        }
    }

    async fn initiate(&self, file: &LocalFile, directory: &CloudItem) -> CloudResult<Initiated> {
        let upload_id = self.initiate_upload().await?;
        Ok(Initiated::Session(UploadSession::new(
            file.clone(),
            self.part_size,
            directory.clone(),
            ContinuationToken::ObjectStorage {
                bucket: self.target.bucket.clone(),
                object: self.target.object.clone(),
                upload_id,
            },
        )))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part: &UploadPart,
        data: Bytes,
        progress: SendProgress,
    ) -> CloudResult<PartAck> {
        let etag = self
            .upload_part_data(upload_id_of(session)?, part.part_number, data, progress)
            .await?;
        Ok(PartAck {
            etag: Some(etag),
            ..PartAck::default()
        })
    }

    async fn commit(&self, session: &UploadSession) -> CloudResult<UploadResult> {
        let response = self
            .complete_upload(upload_id_of(session)?, &session.parts)
            .await?;
        let name = session.local_file.name.clone();
        let path = join_path(session.target_directory.path(), &name);
        let item = CloudItem::new(self.target.object.clone(), name, path, false)
            .with_size(session.total_size as i64)
            .with_raw(response.json().unwrap_or(Value::Null));
        Ok(UploadResult {
            item,
            response: Some(response),
            rapid_upload: false,
        })
    }

    async fn abort(&self, session: &UploadSession) -> CloudResult<()> {
        let upload_id = upload_id_of(session)?;
        if let Err(e) = self.abort_upload(upload_id).await {
            warn!("OSS 放弃上传失败: upload_id={}, 错误: {}", upload_id, e);
            return Err(e);
        }
        Ok(())
    }
}
