// HTTP 传输层
//
// 生产环境使用 reqwest，测试中替换为脚本化的假传输

use crate::config::HttpConfig;
use crate::error::CloudResult;
use crate::http::types::{BodyData, HttpBody, HttpRequest, MultipartBody, RawResponse, SendProgress};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::multipart::{Form, Part};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// 流式发送时每块大小（64KB）
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// 发送单个请求的传输层
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> CloudResult<RawResponse>;
}

/// 基于 reqwest 的传输层
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// 根据 HTTP 配置创建
    pub fn new(config: &HttpConfig) -> CloudResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self { client })
    }

    /// 使用已有的 reqwest 客户端
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> CloudResult<RawResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &request.body {
            HttpBody::Empty => builder,
            HttpBody::Json(value) => builder.json(value),
            HttpBody::Form(fields) => builder.form(fields),
            HttpBody::Bytes(data) => match &request.progress {
                Some(progress) => builder
                    .header(reqwest::header::CONTENT_LENGTH, data.len())
                    .body(progress_body(data.clone(), progress.clone())),
                None => builder.body(data.clone()),
            },
            HttpBody::File { path, len } => builder
                .header(reqwest::header::CONTENT_LENGTH, *len)
                .body(file_body(path, request.progress.clone()).await?),
            HttpBody::Multipart(form) => {
                builder.multipart(build_form(form, request.progress.as_ref()).await?)
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        debug!(
            "HTTP {} {} -> {} ({} bytes)",
            request.method,
            request.url,
            status,
            body.len()
        );

        Ok(RawResponse::new(status, headers, body))
    }
}

/// 将字节切成 64KB 的流，每发出一块回调一次累计字节数
fn progress_body(data: Bytes, progress: SendProgress) -> reqwest::Body {
    let total = data.len();
    let chunks: Vec<Bytes> = (0..total)
        .step_by(STREAM_CHUNK_SIZE)
        .map(|start| data.slice(start..(start + STREAM_CHUNK_SIZE).min(total)))
        .collect();

    let mut sent = 0u64;
    let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
        sent += chunk.len() as u64;
        progress(sent);
        Ok::<Bytes, std::io::Error>(chunk)
    }));
    reqwest::Body::wrap_stream(stream)
}

/// 本地文件按 64KB 块读取的流，每读出一块回调一次累计字节数
pub(crate) fn file_stream(
    file: tokio::fs::File,
    progress: Option<SendProgress>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static {
    let mut sent = 0u64;
    ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE).inspect_ok(move |chunk| {
        sent += chunk.len() as u64;
        if let Some(progress) = &progress {
            progress(sent);
        }
    })
}

/// 每次发送都重新打开文件，401 重试时从头读取
async fn file_body(path: &Path, progress: Option<SendProgress>) -> CloudResult<reqwest::Body> {
    let file = tokio::fs::File::open(path).await?;
    Ok(reqwest::Body::wrap_stream(file_stream(file, progress)))
}

async fn build_form(body: &MultipartBody, progress: Option<&SendProgress>) -> CloudResult<Form> {
    let mut form = Form::new();
    for (name, value) in &body.fields {
        form = form.text(name.clone(), value.clone());
    }
    if let Some(file) = &body.file {
        let part = match (&file.data, progress) {
            (BodyData::Bytes(data), Some(progress)) => Part::stream_with_length(
                progress_body(data.clone(), progress.clone()),
                data.len() as u64,
            ),
            (BodyData::Bytes(data), None) => Part::bytes(data.to_vec()),
            (BodyData::File { path, len }, progress) => {
                Part::stream_with_length(file_body(path, progress.cloned()).await?, *len)
            }
        };
        form = form.part(file.field.clone(), part.file_name(file.file_name.clone()));
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_file_stream_reads_in_chunks_with_progress() {
        let content: Vec<u8> = (0..150 * 1024).map(|i| (i % 251) as u8).collect();
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&content).unwrap();
        temp.flush().unwrap();

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let progress: SendProgress = Arc::new(move |sent| sink.lock().push(sent));
        let file = tokio::fs::File::open(temp.path()).await.unwrap();
        let chunks: Vec<Bytes> = file_stream(file, Some(progress))
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|chunk| chunk.len() <= STREAM_CHUNK_SIZE));
        assert_eq!(chunks.concat(), content);
        let reports = reports.lock();
        assert!(reports.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(reports.last().copied(), Some(content.len() as u64));
    }

    #[tokio::test]
    async fn test_missing_file_body_is_io_error() {
        let err = file_body(Path::new("/definitely/not/here.bin"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CloudServiceError::Io(_)));
    }
}
