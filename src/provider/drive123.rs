// 123云盘开放平台
//
// 每个请求都要带 `Platform: open_platform`；业务数据包在 `data` 中

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, MultipartBody, RawResponse, RequestPipeline, SendProgress};
use crate::provider::classifier::Drive123Classifier;
use crate::provider::{
    collect_all, join_path, json_i64, json_str, parse_china_datetime, require_str,
    CloudFileProvider, CloudItem, CloudSearching, CloudSpaceInformation, CloudUser,
    DownloadRequest, Page, ProviderContext, UploadOptions, UploadResult,
};
use crate::uploader::rapid_upload::md5_hex;
use crate::uploader::{
    ChunkedUploadEngine, ContinuationToken, Initiated, LocalFile, PartAck, RapidUploadChecker,
    TransferMode, UploadPart, UploadProtocol, UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PAGE_LIMIT: u64 = 100;

/// 异步合并结果的轮询次数与间隔
const ASYNC_RESULT_ATTEMPTS: u32 = 30;
const ASYNC_RESULT_INTERVAL: Duration = Duration::from_secs(1);

fn with_platform(request: HttpRequest) -> HttpRequest {
    request.header("Platform", "open_platform")
}

/// 接口里的文件 ID 都是数字
fn numeric_id(id: &str) -> Value {
    id.parse::<i64>().map(Value::from).unwrap_or_else(|_| json!(id))
}

/// 业务数据：`data`，缺省时取整个响应
fn data_of(json: &Value) -> &Value {
    json.get("data").filter(|data| data.is_object()).unwrap_or(json)
}

pub struct Drive123Provider {
    pipeline: Arc<RequestPipeline>,
    api: String,
    max_parallel: usize,
}

impl Drive123Provider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(Drive123Classifier), AuthScheme::Bearer);
        Self {
            pipeline: Arc::new(pipeline),
            api: context.endpoints.drive123_api.trim_end_matches('/').to_string(),
            max_parallel: context.upload.max_concurrent_parts.max(1),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api, path)
    }

    async fn get(&self, path: &str, query: &[(&str, Value)]) -> CloudResult<(RawResponse, Value)> {
        let mut request = with_platform(HttpRequest::get(self.url(path)));
        for (key, value) in query {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.query(*key, value);
        }
        self.pipeline.execute_json(request).await
    }

    async fn send_json(&self, request: HttpRequest, body: Value) -> CloudResult<RawResponse> {
        self.pipeline.execute(with_platform(request).json(body)).await
    }

    /// `lastFileId` 翻页，-1 表示最后一页
    async fn list_page(
        &self,
        mut query: Vec<(&'static str, Value)>,
        last_file_id: Option<String>,
    ) -> CloudResult<Page<CloudItem>> {
        query.push(("limit", json!(PAGE_LIMIT)));
        if let Some(last) = last_file_id {
            query.push(("lastFileId", json!(last)));
        }
        let (response, json) = self.get("/api/v2/file/list", &query).await?;
        let data = data_of(&json);
        let list = data
            .get("fileList")
            .and_then(Value::as_array)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 fileList", &response))?;
        let items = list.iter().filter_map(item_from_json).collect();
        let next = json_i64(data.get("lastFileId"))
            .filter(|last| *last > 0)
            .map(|last| last.to_string());
        Ok(Page::new(items, next))
    }
}

/// 回收站中的文件（trashed == 1）不返回
fn item_from_json(json: &Value) -> Option<CloudItem> {
    if json_i64(json.get("trashed")) == Some(1) {
        return None;
    }
    let id = json_str(json, "fileId").or_else(|| json_str(json, "fileID"))?;
    let name = json_str(json, "filename")?;
    let is_directory = json_i64(json.get("type")) == Some(1);
    let item = CloudItem::new(id, name.clone(), name, is_directory)
        .with_size(json_i64(json.get("size")).unwrap_or(-1))
        .with_hash(json_str(json, "etag"))
        .with_times(
            parse_china_datetime(json.get("createAt")),
            parse_china_datetime(json.get("updateAt")),
        )
        .with_raw(json.clone());
    Some(item)
}

#[async_trait]
impl CloudFileProvider for Drive123Provider {
    fn name(&self) -> &'static str {
        "123Pan"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("0", "123Pan", "/", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem> {
        let (response, json) = self
            .get("/api/v1/file/detail", &[("fileID", json!(item.id))])
            .await?;
        item_from_json(data_of(&json))
            .map(|found| found.at_path(item.path()))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let fetch = |last: Option<String>| {
            self.list_page(vec![("parentFileId", json!(directory.id))], last)
        };
        let mut items = collect_all(fetch).await?;
        for item in &mut items {
            item.fix_path(directory);
        }
        Ok(items)
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({ "parentID": numeric_id(&directory.id), "name": name });
        self.send_json(HttpRequest::post(self.url("/upload/v1/file/mkdir")), body)
            .await
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let body = json!({ "fileId": numeric_id(&item.id), "fileName": new_name });
        self.send_json(HttpRequest::put(self.url("/api/v1/file/name")), body)
            .await
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({
            "fileIDs": [numeric_id(&item.id)],
            "toParentFileID": numeric_id(&directory.id),
        });
        self.send_json(HttpRequest::post(self.url("/api/v1/file/move")), body)
            .await
    }

    /// 移入回收站
    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({ "fileIDs": [numeric_id(&item.id)] });
        self.send_json(HttpRequest::post(self.url("/api/v1/file/trash")), body)
            .await
    }

    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        let (response, json) = self
            .get("/api/v1/file/download_info", &[("fileId", json!(item.id))])
            .await?;
        let url = require_str(data_of(&json), "downloadUrl", &response)?;
        Ok(DownloadRequest::new(url))
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        let (response, json) = self.get("/api/v1/user/info", &[]).await?;
        let data = data_of(&json).clone();
        let username = require_str(&data, "nickname", &response)?;
        Ok(CloudUser {
            username,
            raw_attributes: data,
        })
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        let (response, json) = self.get("/api/v1/user/info", &[]).await?;
        let data = data_of(&json).clone();
        let total = json_i64(data.get("spacePermanent"))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 spacePermanent", &response))?;
        let used = json_i64(data.get("spaceUsed")).unwrap_or(0);
        Ok(CloudSpaceInformation {
            total_space: total,
            available_space: total - used,
            raw_attributes: data,
        })
    }

    async fn upload_local(
        &self,
        file: LocalFile,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        let protocol = Drive123Upload {
            pipeline: Arc::clone(&self.pipeline),
            api: self.api.clone(),
            max_parallel: self.max_parallel,
        };
        ChunkedUploadEngine::new(Arc::new(protocol), options)
            .upload(file, directory)
            .await
    }

    fn as_searching(&self) -> Option<&dyn CloudSearching> {
        Some(self)
    }
}

#[async_trait]
impl CloudSearching for Drive123Provider {
    /// 全局模糊搜索
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        let fetch = |last: Option<String>| {
            let query = vec![
                ("parentFileId", json!(0)),
                ("searchData", json!(keyword)),
                ("searchMode", json!(1)),
            ];
            self.list_page(query, last)
        };
        let mut items = collect_all(fetch).await?;
        for item in &mut items {
            let path = join_path("/", &item.name);
            *item = item.clone().at_path(path);
        }
        Ok(items)
    }
}

/// 123云盘分片协议
///
/// create 按 MD5 秒传检查，未命中时返回 preuploadID、分片大小与上传服务器；
/// 分片彼此独立，可并发上传；最后 upload_complete 合并
struct Drive123Upload {
    pipeline: Arc<RequestPipeline>,
    api: String,
    max_parallel: usize,
}

impl Drive123Upload {
    async fn post(&self, path: &str, body: Value) -> CloudResult<(RawResponse, Value)> {
        let request = with_platform(HttpRequest::post(format!("{}{}", self.api, path))).json(body);
        self.pipeline.execute_json(request).await
    }

    /// 服务端异步合并时轮询结果
    async fn wait_async_result(&self, preupload_id: &str) -> CloudResult<(RawResponse, Value)> {
        let mut attempt = 0;
        loop {
            tokio::time::sleep(ASYNC_RESULT_INTERVAL).await;
            attempt += 1;
            let (response, json) = self
                .post(
                    "/upload/v1/file/upload_async_result",
                    json!({ "preuploadID": preupload_id }),
                )
                .await?;
            if data_of(&json).get("completed").and_then(Value::as_bool) == Some(true) {
                return Ok((response, json));
            }
            if attempt >= ASYNC_RESULT_ATTEMPTS {
                warn!("123云盘合并超时: preuploadID={}", preupload_id);
                return Err(CloudServiceError::decode("文件合并未完成", &response));
            }
            debug!("123云盘等待合并: preuploadID={}, 第 {} 次", preupload_id, attempt);
        }
    }
}

fn uploaded_item(
    data: &Value,
    file: &LocalFile,
    directory: &CloudItem,
    response: RawResponse,
    rapid_upload: bool,
) -> CloudResult<UploadResult> {
    let id = json_str(data, "fileID")
        .filter(|id| id != "0")
        .ok_or_else(|| CloudServiceError::decode("响应中缺少 fileID", &response))?;
    let item = CloudItem::new(id, file.name.clone(), join_path(directory.path(), &file.name), false)
        .with_size(file.size as i64)
        .with_raw(data.clone());
    Ok(UploadResult {
        item,
        response: Some(response),
        rapid_upload,
    })
}

#[async_trait]
impl UploadProtocol for Drive123Upload {
    fn name(&self) -> &'static str {
        "123pan"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Concurrent {
            max_parallel: self.max_parallel,
        }
    }

    async fn initiate(&self, file: &LocalFile, directory: &CloudItem) -> CloudResult<Initiated> {
        let hash = RapidUploadChecker::calculate_hash(&file.path).await?;
        let body = json!({
            "parentFileID": numeric_id(&directory.id),
            "filename": file.name,
            "etag": hash.content_md5,
            "size": file.size,
            "duplicate": 1,
        });
        let (response, json) = self.post("/upload/v2/file/create", body).await?;
        let data = data_of(&json);

        if data.get("reuse").and_then(Value::as_bool) == Some(true) {
            info!("123云盘秒传: {}", file.name);
            let result = uploaded_item(data, file, directory, response, true)?;
            return Ok(Initiated::Completed(result));
        }

        let preupload_id = require_str(data, "preuploadID", &response)?;
        let slice_size = json_i64(data.get("sliceSize"))
            .filter(|size| *size > 0)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 sliceSize", &response))?;
        let server = data
            .get("servers")
            .and_then(|servers| servers.get(0))
            .and_then(Value::as_str)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少上传服务器", &response))?;
        debug!(
            "123云盘上传会话: preuploadID={}, sliceSize={}, server={}",
            preupload_id, slice_size, server
        );

        Ok(Initiated::Session(
            UploadSession::new(
                file.clone(),
                slice_size as u64,
                directory.clone(),
                ContinuationToken::UploadId(preupload_id),
            )
            .with_extra(json!({ "server": server.trim_end_matches('/') })),
        ))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part: &UploadPart,
        data: Bytes,
        progress: SendProgress,
    ) -> CloudResult<PartAck> {
        let server = json_str(&session.extra, "server").unwrap_or_default();
        let slice_md5 = md5_hex(&data);
        let body = MultipartBody::new()
            .text("preuploadID", session.continuation.as_str())
            .text("sliceNo", part.part_number.to_string())
            .text("sliceMD5", slice_md5.clone())
            .file("slice", format!("slice{}", part.part_number), data);
        let request = with_platform(HttpRequest::post(format!("{}/upload/v2/file/slice", server)))
            .multipart(body)
            .on_progress(progress);
        self.pipeline.execute(request).await?;
        Ok(PartAck {
            content_digest: Some(slice_md5),
            ..PartAck::default()
        })
    }

    async fn commit(&self, session: &UploadSession) -> CloudResult<UploadResult> {
        let preupload_id = session.continuation.as_str();
        let (response, json) = self
            .post(
                "/upload/v2/file/upload_complete",
                json!({ "preuploadID": preupload_id }),
            )
            .await?;
        let data = data_of(&json);
        let completed = data.get("completed").and_then(Value::as_bool) == Some(true);
        let (response, json) = if completed {
            (response, json.clone())
        } else {
            self.wait_async_result(preupload_id).await?
        };
        uploaded_item(
            data_of(&json),
            &session.local_file,
            &session.target_directory,
            response,
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::http::testing::ScriptedTransport;
    use crate::http::HttpBody;
    use reqwest::Method;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn provider(transport: Arc<ScriptedTransport>) -> Drive123Provider {
        Drive123Provider::new(ProviderContext::new(Credential::new("u", "tok"), transport))
    }

    fn ok(data: Value) -> Value {
        json!({ "code": 0, "message": "ok", "data": data })
    }

    fn temp_file(len: usize) -> (NamedTempFile, Vec<u8>) {
        let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&content).unwrap();
        file.flush().unwrap();
        (file, content)
    }

    #[tokio::test]
    async fn test_list_follows_last_file_id_and_skips_trash() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            ok(json!({
                "lastFileId": 33,
                "fileList": [
                    {"fileId": 31, "filename": "docs", "type": 1, "size": 0},
                    {"fileId": 32, "filename": "old.txt", "type": 0, "size": 5, "trashed": 1}
                ]
            })),
        );
        transport.push_json(
            200,
            ok(json!({
                "lastFileId": -1,
                "fileList": [
                    {"fileId": 33, "filename": "a.txt", "type": 0, "size": 7,
                     "etag": "abc", "createAt": "2025-02-16 10:00:00"}
                ]
            })),
        );
        let provider = provider(Arc::clone(&transport));

        let items = provider
            .contents_of_directory(&provider.root_item())
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert!(items[0].is_directory);
        assert_eq!(items[1].path(), "/a.txt");
        assert_eq!(items[1].content_hash.as_deref(), Some("abc"));
        assert!(items[1].creation_time.is_some());

        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].header_value("Platform"), Some("open_platform"));
        assert_eq!(sent[0].header_value("Authorization"), Some("Bearer tok"));
        assert_eq!(sent[0].query_value("lastFileId"), None);
        assert_eq!(sent[1].query_value("lastFileId"), Some("33"));
    }

    #[tokio::test]
    async fn test_error_code_is_service_error() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({ "code": 5066, "message": "文件不存在" }));
        let provider = provider(Arc::clone(&transport));
        let item = CloudItem::new("9", "x", "/x", false);

        let err = provider.remove_item(&item).await.unwrap_err();

        assert_eq!(err.code(), Some(5066));
        assert!(err.response().is_some());
        match &transport.requests()[0].body {
            HttpBody::Json(body) => assert_eq!(body["fileIDs"], json!([9])),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reuse_skips_slices() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, ok(json!({ "fileID": 88, "reuse": true })));
        let provider = provider(Arc::clone(&transport));
        let (file, content) = temp_file(100);
        let local = LocalFile::open_named(file.path(), "a.bin").await.unwrap();

        let result = provider
            .upload_local(local, &provider.root_item(), UploadOptions::default())
            .await
            .unwrap();

        assert!(result.rapid_upload);
        assert_eq!(result.item.id, "88");
        assert_eq!(transport.request_count(), 1);
        match &transport.requests()[0].body {
            HttpBody::Json(body) => {
                assert_eq!(body["etag"], md5_hex(&content));
                assert_eq!(body["size"], 100);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slices_upload_to_server_then_complete() {
        let transport = ScriptedTransport::with_responder(|request| {
            let url = request.url.as_str();
            let body = if url.ends_with("/upload/v2/file/create") {
                ok(json!({
                    "reuse": false,
                    "preuploadID": "P1",
                    "sliceSize": 40,
                    "servers": ["https://up.example.com/"]
                }))
            } else if url.ends_with("/upload/v2/file/upload_complete") {
                ok(json!({ "completed": true, "fileID": 99 }))
            } else {
                ok(json!({}))
            };
            Ok(RawResponse::from_json(200, &body))
        });
        let provider = provider(Arc::clone(&transport));
        let (file, content) = temp_file(100);
        let local = LocalFile::open_named(file.path(), "a.bin").await.unwrap();
        let dir = CloudItem::new("5", "up", "/up", true);

        let result = provider
            .upload_local(local, &dir, UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(result.item.id, "99");
        assert_eq!(result.item.path(), "/up/a.bin");
        assert!(!result.rapid_upload);

        let sent = transport.requests();
        let mut slices: Vec<(u32, String, u64)> = sent
            .iter()
            .filter(|r| r.method == Method::POST && r.url == "https://up.example.com/upload/v2/file/slice")
            .map(|r| match &r.body {
                HttpBody::Multipart(body) => {
                    let field = |name: &str| {
                        body.fields
                            .iter()
                            .find(|(k, _)| k == name)
                            .map(|(_, v)| v.clone())
                            .unwrap()
                    };
                    assert_eq!(field("preuploadID"), "P1");
                    let data = &body.file.as_ref().unwrap().data;
                    (field("sliceNo").parse().unwrap(), field("sliceMD5"), data.len())
                }
                other => panic!("unexpected body: {:?}", other),
            })
            .collect();
        slices.sort();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0], (1, md5_hex(&content[..40]), 40));
        assert_eq!(slices[2], (3, md5_hex(&content[80..]), 20));
        assert!(sent.last().unwrap().url.ends_with("/upload/v2/file/upload_complete"));
    }
}
