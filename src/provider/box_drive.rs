// Box
//
// 20MB 以下的文件走 multipart 单请求上传，更大的文件走分片会话

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{
    AuthScheme, HttpRequest, MultipartBody, RawResponse, RequestPipeline, SendProgress,
};
use crate::provider::classifier::BoxClassifier;
use crate::provider::{
    collect_all, json_i64, json_str, parse_rfc3339, require_str, upload_in_one_request,
    CloudCopying, CloudFileProvider, CloudItem, CloudSearching, CloudSpaceInformation, CloudUser,
    DownloadRequest, Page, ProviderContext, UploadOptions, UploadResult,
};
use crate::uploader::rapid_upload::{file_sha1_base64, sha1_base64};
use crate::uploader::{
    ChunkedUploadEngine, ContinuationToken, Initiated, LocalFile, PartAck, TransferMode,
    UploadPart, UploadProtocol, UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// 分片上传的最小文件大小（Box 要求）
pub const BOX_CHUNKED_THRESHOLD: u64 = 20 * 1024 * 1024;

const PAGE_LIMIT: u64 = 1000;

const ITEM_FIELDS: &str = "id,type,name,size,created_at,modified_at,sha1,path_collection";

pub struct BoxProvider {
    pipeline: Arc<RequestPipeline>,
    api: String,
    upload_api: String,
}

impl BoxProvider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(BoxClassifier), AuthScheme::Bearer);
        Self {
            pipeline: Arc::new(pipeline),
            api: context.endpoints.box_api.trim_end_matches('/').to_string(),
            upload_api: context.endpoints.box_upload.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api, path)
    }

    /// folders/{id} 或 files/{id}
    fn item_url(&self, item: &CloudItem) -> String {
        let kind = if item.is_directory { "folders" } else { "files" };
        self.url(&format!("{}/{}", kind, item.id))
    }

    /// offset 分页：下一页偏移作为续页令牌
    async fn offset_page(
        &self,
        request: HttpRequest,
        offset: Option<String>,
    ) -> CloudResult<Page<CloudItem>> {
        let offset: u64 = offset.and_then(|o| o.parse().ok()).unwrap_or(0);
        let request = request.query("limit", PAGE_LIMIT).query("offset", offset);
        let (_, json) = self.pipeline.execute_json(request).await?;
        let items = entries_of(&json);
        let total = json_i64(json.get("total_count")).unwrap_or(0).max(0) as u64;
        let next = offset + items.len() as u64;
        let token = if items.is_empty() || next >= total {
            None
        } else {
            Some(next.to_string())
        };
        Ok(Page::new(items, token))
    }
}

fn item_from_json(json: &Value) -> Option<CloudItem> {
    let id = json_str(json, "id")?;
    let name = json_str(json, "name")?;
    let is_directory = json.get("type").and_then(Value::as_str) == Some("folder");
    let item = CloudItem::new(id, name.clone(), name, is_directory)
        .with_size(if is_directory {
            -1
        } else {
            json_i64(json.get("size")).unwrap_or(-1)
        })
        .with_hash(json_str(json, "sha1"))
        .with_times(
            parse_rfc3339(json.get("created_at")),
            parse_rfc3339(json.get("modified_at")),
        )
        .with_raw(json.clone());
    Some(item)
}

fn entries_of(json: &Value) -> Vec<CloudItem> {
    json.get("entries")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(item_from_json).collect())
        .unwrap_or_default()
}

/// path_collection 拼出的完整路径
fn path_of(json: &Value, name: &str) -> Option<String> {
    let entries = json.get("path_collection")?.get("entries")?.as_array()?;
    let mut path = String::new();
    // 第一个为根目录 "All Files"
    for entry in entries.iter().skip(1) {
        path.push('/');
        path.push_str(entry.get("name")?.as_str()?);
    }
    path.push('/');
    path.push_str(name);
    Some(path)
}

/// 提交/单请求上传返回的 `entries[0]`
fn uploaded_item(
    response: RawResponse,
    directory: &CloudItem,
    rapid_upload: bool,
) -> CloudResult<UploadResult> {
    let mut item = response
        .json()
        .as_ref()
        .and_then(|json| json.get("entries"))
        .and_then(|entries| entries.get(0))
        .and_then(item_from_json)
        .ok_or_else(|| CloudServiceError::decode("响应中缺少上传后的文件", &response))?;
    item.fix_path(directory);
    Ok(UploadResult {
        item,
        response: Some(response),
        rapid_upload,
    })
}

#[async_trait]
impl CloudFileProvider for BoxProvider {
    fn name(&self) -> &'static str {
        "Box"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("0", "All Files", "/", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem> {
        let request = HttpRequest::get(self.item_url(item)).query("fields", ITEM_FIELDS);
        let (response, json) = self.pipeline.execute_json(request).await?;
        let found = item_from_json(&json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))?;
        let path = path_of(&json, &found.name).unwrap_or_else(|| item.path().to_string());
        Ok(found.at_path(path))
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let url = self.url(&format!("folders/{}/items", directory.id));
        let fetch = |offset: Option<String>| {
            let request = HttpRequest::get(url.clone()).query("fields", ITEM_FIELDS);
            self.offset_page(request, offset)
        };
        let mut items = collect_all(fetch).await?;
        for item in &mut items {
            item.fix_path(directory);
        }
        Ok(items)
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({ "name": name, "parent": { "id": directory.id } });
        self.pipeline
            .execute(HttpRequest::post(self.url("folders")).json(body))
            .await
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let request = HttpRequest::put(self.item_url(item)).json(json!({ "name": new_name }));
        self.pipeline.execute(request).await
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let request =
            HttpRequest::put(self.item_url(item)).json(json!({ "parent": { "id": directory.id } }));
        self.pipeline.execute(request).await
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        let mut request = HttpRequest::delete(self.item_url(item));
        if item.is_directory {
            request = request.query("recursive", true);
        }
        self.pipeline.execute(request).await
    }

    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        let token = self.credential().token.clone();
        Ok(DownloadRequest::new(self.url(&format!("files/{}/content", item.id)))
            .header("Authorization", format!("Bearer {}", token)))
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        let (response, json) = self
            .pipeline
            .execute_json(HttpRequest::get(self.url("users/me")))
            .await?;
        let username = require_str(&json, "name", &response)?;
        Ok(CloudUser {
            username,
            raw_attributes: json,
        })
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        let (response, json) = self
            .pipeline
            .execute_json(HttpRequest::get(self.url("users/me")))
            .await?;
        let total = json_i64(json.get("space_amount"))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少空间信息", &response))?;
        let used = json_i64(json.get("space_used")).unwrap_or(0);
        Ok(CloudSpaceInformation {
            total_space: total,
            available_space: total - used,
            raw_attributes: json,
        })
    }

    async fn upload_local(
        &self,
        file: LocalFile,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        if file.size == 0 {
            warn!("Box 不支持上传空文件: {:?}", file.path);
            return Err(CloudServiceError::Unsupported);
        }

        if file.size < BOX_CHUNKED_THRESHOLD {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            let attributes = json!({
                "name": file.name,
                "parent": { "id": directory.id },
                "content_created_at": now,
                "content_modified_at": now,
            });
            let url = format!("{}/files/content", self.upload_api);
            let name = file.name.clone();
            let response = upload_in_one_request(&self.pipeline, &file, &options, move |data| {
                HttpRequest::post(url).multipart(
                    MultipartBody::new()
                        .text("attributes", attributes.to_string())
                        .file("file", name, data),
                )
            })
            .await?;
            return uploaded_item(response, directory, false);
        }

        let protocol = BoxUpload {
            pipeline: Arc::clone(&self.pipeline),
            upload_api: self.upload_api.clone(),
        };
        ChunkedUploadEngine::new(Arc::new(protocol), options)
            .upload(file, directory)
            .await
    }

    fn as_copying(&self) -> Option<&dyn CloudCopying> {
        Some(self)
    }

    fn as_searching(&self) -> Option<&dyn CloudSearching> {
        Some(self)
    }
}

#[async_trait]
impl CloudCopying for BoxProvider {
    async fn copy_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let request = HttpRequest::post(format!("{}/copy", self.item_url(item)))
            .json(json!({ "parent": { "id": directory.id } }));
        self.pipeline.execute(request).await
    }
}

#[async_trait]
impl CloudSearching for BoxProvider {
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        let url = self.url("search");
        let fetch = |offset: Option<String>| {
            let request = HttpRequest::get(url.clone())
                .query("query", keyword)
                .query("fields", ITEM_FIELDS);
            async move {
                let mut page = self.offset_page(request, offset).await?;
                for item in &mut page.items {
                    if let Some(path) = path_of(&item.raw_attributes, &item.name) {
                        *item = item.clone().at_path(path);
                    }
                }
                Ok(page)
            }
        };
        collect_all(fetch).await
    }
}

/// Box 分片会话协议
///
/// 会话给出分片大小；每个分片带 Content-Range 与 SHA1 Digest，提交时附上全部分片记录
struct BoxUpload {
    pipeline: Arc<RequestPipeline>,
    upload_api: String,
}

impl BoxUpload {
    fn session_url(&self, session_id: &str) -> String {
        format!("{}/files/upload_sessions/{}", self.upload_api, session_id)
    }
}

#[async_trait]
impl UploadProtocol for BoxUpload {
    fn name(&self) -> &'static str {
        "box"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Sequential
    }

    fn allows_empty_file(&self) -> bool {
        false
    }

    async fn initiate(&self, file: &LocalFile, directory: &CloudItem) -> CloudResult<Initiated> {
        let url = format!("{}/files/upload_sessions", self.upload_api);
        let body = json!({
            "file_name": file.name,
            "file_size": file.size,
            "folder_id": directory.id,
        });
        let (response, json) = self
            .pipeline
            .execute_json(HttpRequest::post(url).json(body))
            .await?;
        let session_id = require_str(&json, "id", &response)?;
        let part_size = json_i64(json.get("part_size"))
            .filter(|size| *size > 0)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 part_size", &response))?;
        debug!("Box 上传会话: id={}, part_size={}", session_id, part_size);

        Ok(Initiated::Session(UploadSession::new(
            file.clone(),
            part_size as u64,
            directory.clone(),
            ContinuationToken::UploadId(session_id),
        )))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part: &UploadPart,
        data: Bytes,
        progress: SendProgress,
    ) -> CloudResult<PartAck> {
        let digest = sha1_base64(&data);
        let range = format!(
            "bytes {}-{}/{}",
            part.range.start,
            part.range.end - 1,
            session.total_size
        );
        let request = HttpRequest::put(self.session_url(session.continuation.as_str()))
            .header("Content-Range", range)
            .header("Digest", format!("sha={}", digest))
            .header("Content-Type", "application/octet-stream")
            .bytes(data)
            .on_progress(progress);
        let (response, json) = self.pipeline.execute_json(request).await?;
        let record = json
            .get("part")
            .cloned()
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 part", &response))?;
        let next = match (json_i64(record.get("offset")), json_i64(record.get("size"))) {
            (Some(offset), Some(size)) => Some((offset + size) as u64),
            _ => None,
        };
        Ok(PartAck {
            content_digest: Some(digest),
            remote: Some(record),
            next_offset: next,
            ..PartAck::default()
        })
    }

    async fn commit(&self, session: &UploadSession) -> CloudResult<UploadResult> {
        let digest = file_sha1_base64(&session.local_file.path).await?;
        let parts: Vec<Value> = session
            .parts
            .iter()
            .filter_map(|part| part.remote.clone())
            .collect();
        let url = format!("{}/commit", self.session_url(session.continuation.as_str()));
        let request = HttpRequest::post(url)
            .header("Digest", format!("sha={}", digest))
            .json(json!({ "parts": parts }));
        let response = self.pipeline.execute(request).await?;
        uploaded_item(response, &session.target_directory, false)
    }

    async fn abort(&self, session: &UploadSession) -> CloudResult<()> {
        let request = HttpRequest::delete(self.session_url(session.continuation.as_str()));
        self.pipeline.execute(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::http::testing::ScriptedTransport;
    use crate::http::{BodyData, HttpBody};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn provider(transport: Arc<ScriptedTransport>) -> BoxProvider {
        BoxProvider::new(ProviderContext::new(Credential::new("u", "token"), transport))
    }

    fn temp_file(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![3u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_list_uses_offset_pages() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({"total_count": 2, "entries": [{"id": "11", "type": "file", "name": "a.txt", "size": 4}]}),
        );
        transport.push_json(
            200,
            json!({"total_count": 2, "entries": [{"id": "12", "type": "folder", "name": "sub"}]}),
        );
        let provider = provider(Arc::clone(&transport));

        let items = provider
            .contents_of_directory(&provider.root_item())
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path(), "/a.txt");
        assert!(items[1].is_directory);
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].url.ends_with("folders/0/items"));
        assert_eq!(sent[0].query_value("offset"), Some("0"));
        assert_eq!(sent[1].query_value("offset"), Some("1"));
    }

    #[tokio::test]
    async fn test_error_envelope_classified() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            404,
            json!({"type": "error", "status": 404, "code": "not_found", "message": "Not Found"}),
        );
        let provider = provider(Arc::clone(&transport));
        let err = provider
            .remove_item(&CloudItem::new("9", "x", "/x", true))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(404));
        assert!(err.response().is_some());
        assert_eq!(transport.requests()[0].query_value("recursive"), Some("true"));
    }

    #[tokio::test]
    async fn test_small_file_single_multipart_request() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            201,
            json!({"total_count": 1, "entries": [{"id": "77", "type": "file", "name": "n.txt", "size": 10}]}),
        );
        let provider = provider(Arc::clone(&transport));
        let file = temp_file(10);
        let local = LocalFile::open_named(file.path(), "n.txt").await.unwrap();
        let dir = CloudItem::new("5", "docs", "/docs", true);

        let result = provider
            .upload_local(local, &dir, UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(result.item.id, "77");
        assert_eq!(result.item.path(), "/docs/n.txt");
        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].url.ends_with("/files/content"));
        match &sent[0].body {
            HttpBody::Multipart(form) => {
                let attributes: Value = serde_json::from_str(&form.fields[0].1).unwrap();
                assert_eq!(attributes["parent"]["id"], "5");
                let part = form.file.as_ref().unwrap();
                assert_eq!(part.data.len(), 10);
                assert!(matches!(part.data, BodyData::File { .. }));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_file_rejected_without_request() {
        let transport = ScriptedTransport::new();
        let provider = provider(Arc::clone(&transport));
        let file = temp_file(0);
        let local = LocalFile::open(file.path()).await.unwrap();

        let err = provider
            .upload_local(local, &provider.root_item(), UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudServiceError::Unsupported));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_chunked_session_commits_part_records() {
        let part_size = 8 * 1024 * 1024u64;
        let size = BOX_CHUNKED_THRESHOLD + 5;
        let transport = ScriptedTransport::new();
        transport.push_json(201, json!({"id": "S1", "part_size": part_size}));
        for (index, offset) in [0, part_size, 2 * part_size].iter().enumerate() {
            let len = (size - offset).min(part_size);
            transport.push_json(
                200,
                json!({"part": {"part_id": format!("P{}", index), "offset": offset, "size": len, "sha1": "x"}}),
            );
        }
        transport.push_json(
            201,
            json!({"entries": [{"id": "88", "type": "file", "name": "big.bin", "size": size}]}),
        );
        let provider = provider(Arc::clone(&transport));
        let file = temp_file(size as usize);
        let local = LocalFile::open_named(file.path(), "big.bin").await.unwrap();

        let result = provider
            .upload_local(local, &provider.root_item(), UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(result.item.id, "88");
        let sent = transport.requests();
        assert_eq!(sent.len(), 5);
        assert_eq!(
            sent[1].header_value("Content-Range"),
            Some(format!("bytes 0-{}/{}", part_size - 1, size).as_str())
        );
        assert!(sent[1].header_value("Digest").unwrap().starts_with("sha="));
        assert!(sent[4].url.ends_with("upload_sessions/S1/commit"));
        assert!(sent[4].header_value("Digest").unwrap().starts_with("sha="));
        match &sent[4].body {
            HttpBody::Json(body) => {
                assert_eq!(body["parts"].as_array().unwrap().len(), 3);
                assert_eq!(body["parts"][2]["part_id"], "P2");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }
}
