// Dropbox
//
// 以路径寻址；RPC 接口均为 POST JSON，内容接口的参数放在 Dropbox-API-Arg 请求头

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, RawResponse, RequestPipeline, SendProgress};
use crate::provider::classifier::DropboxClassifier;
use crate::provider::{
    collect_all, join_path, json_i64, json_str, parse_rfc3339, require_str, CloudBatching,
    CloudCopying, CloudFileProvider, CloudItem, CloudSearching, CloudSpaceInformation, CloudUser,
    DownloadRequest, Page, ProviderContext, UploadOptions, UploadResult,
};
use crate::uploader::{
    ChunkedUploadEngine, ContinuationToken, Initiated, LocalFile, PartAck, TransferMode,
    UploadPart, UploadProtocol, UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// 分片大小 8MB
pub const DROPBOX_PART_SIZE: u64 = 8 * 1024 * 1024;

const SEARCH_LIMIT: u32 = 100;

pub struct DropboxProvider {
    pipeline: Arc<RequestPipeline>,
    api: String,
    content_api: String,
}

impl DropboxProvider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(DropboxClassifier), AuthScheme::Bearer);
        Self {
            pipeline: Arc::new(pipeline),
            api: context.endpoints.dropbox_api.trim_end_matches('/').to_string(),
            content_api: context
                .endpoints
                .dropbox_content
                .trim_end_matches('/')
                .to_string(),
        }
    }

    async fn rpc(&self, path: &str, body: Value) -> CloudResult<(RawResponse, Value)> {
        let url = format!("{}/{}", self.api, path);
        self.pipeline
            .execute_json(HttpRequest::post(url).json(body))
            .await
    }

    /// 无参数的 RPC（不带请求体）
    async fn rpc_no_args(&self, path: &str) -> CloudResult<(RawResponse, Value)> {
        let url = format!("{}/{}", self.api, path);
        self.pipeline.execute_json(HttpRequest::post(url)).await
    }

    /// `list_folder` 与 `list_folder/continue` 共用的单页解析
    async fn list_page(&self, directory: &CloudItem, cursor: Option<String>) -> CloudResult<Page<CloudItem>> {
        let (_, json) = match cursor {
            None => {
                let body = json!({
                    "path": directory.path(),
                    "recursive": false,
                    "include_deleted": false,
                });
                self.rpc("files/list_folder", body).await?
            }
            Some(cursor) => {
                self.rpc("files/list_folder/continue", json!({ "cursor": cursor }))
                    .await?
            }
        };
        let items = json
            .get("entries")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(item_from_json).collect())
            .unwrap_or_default();
        Ok(Page::new(items, next_cursor(&json)))
    }
}

/// `has_more` 为真时返回游标
fn next_cursor(json: &Value) -> Option<String> {
    if json.get("has_more").and_then(Value::as_bool) == Some(true) {
        json_str(json, "cursor")
    } else {
        None
    }
}

fn item_from_json(json: &Value) -> Option<CloudItem> {
    let name = json_str(json, "name")?;
    let path = json_str(json, "path_display").unwrap_or_else(|| format!("/{}", name));
    let id = json_str(json, "id").unwrap_or_else(|| path.clone());
    let is_directory = json.get(".tag").and_then(Value::as_str) == Some("folder");
    let mut item = CloudItem::new(id, name, path.clone(), is_directory)
        .at_path(path)
        .with_raw(json.clone());
    if !is_directory {
        item = item
            .with_size(json_i64(json.get("size")).unwrap_or(-1))
            .with_hash(json_str(json, "content_hash"))
            .with_times(
                parse_rfc3339(json.get("client_modified")),
                parse_rfc3339(json.get("server_modified")),
            );
    }
    Some(item)
}

/// 父目录路径（根目录为空串）
fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[..index],
        None => "",
    }
}

/// 目标路径：根目录下为 "/name"
fn child_path(directory: &CloudItem, name: &str) -> String {
    join_path(directory.path(), name)
}

/// Dropbox-API-Arg 请求头取值：非 ASCII 字符转义为 \uXXXX
pub fn api_arg_header(arg: &Value) -> String {
    let raw = arg.to_string();
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() {
            escaped.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                let _ = write!(escaped, "\\u{:04x}", unit);
            }
        }
    }
    escaped
}

#[async_trait]
impl CloudFileProvider for DropboxProvider {
    fn name(&self) -> &'static str {
        "Dropbox"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("", "root", "", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem> {
        let (response, json) = self
            .rpc("files/get_metadata", json!({ "path": item.path() }))
            .await?;
        item_from_json(&json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        collect_all(|cursor| self.list_page(directory, cursor)).await
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({ "path": child_path(directory, name), "autorename": false });
        let (response, _) = self.rpc("files/create_folder_v2", body).await?;
        Ok(response)
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let to_path = format!("{}/{}", parent_path(item.path()), new_name);
        let body = json!({ "from_path": item.path(), "to_path": to_path, "autorename": false });
        let (response, _) = self.rpc("files/move_v2", body).await?;
        Ok(response)
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({
            "from_path": item.path(),
            "to_path": child_path(directory, &item.name),
            "autorename": false,
        });
        let (response, _) = self.rpc("files/move_v2", body).await?;
        Ok(response)
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        let (response, _) = self
            .rpc("files/delete_v2", json!({ "path": item.path() }))
            .await?;
        Ok(response)
    }

    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        let (response, json) = self
            .rpc("files/get_temporary_link", json!({ "path": item.path() }))
            .await?;
        Ok(DownloadRequest::new(require_str(&json, "link", &response)?))
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        let (response, json) = self.rpc_no_args("users/get_current_account").await?;
        let username = json
            .get("name")
            .and_then(|name| json_str(name, "display_name"))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少用户名", &response))?;
        Ok(CloudUser {
            username,
            raw_attributes: json,
        })
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        let (response, json) = self.rpc_no_args("users/get_space_usage").await?;
        let used = json_i64(json.get("used"))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少空间信息", &response))?;
        let allocated = json
            .get("allocation")
            .and_then(|allocation| json_i64(allocation.get("allocated")))
            .unwrap_or(0);
        Ok(CloudSpaceInformation {
            total_space: allocated,
            available_space: allocated - used,
            raw_attributes: json,
        })
    }

    async fn upload_local(
        &self,
        file: LocalFile,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        let protocol = DropboxUpload {
            pipeline: Arc::clone(&self.pipeline),
            content_api: self.content_api.clone(),
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

    fn as_batching(&self) -> Option<&dyn CloudBatching> {
        Some(self)
    }
}

#[async_trait]
impl CloudCopying for DropboxProvider {
    async fn copy_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({
            "from_path": item.path(),
            "to_path": child_path(directory, &item.name),
            "autorename": true,
        });
        let (response, _) = self.rpc("files/copy_v2", body).await?;
        Ok(response)
    }
}

#[async_trait]
impl CloudSearching for DropboxProvider {
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        let fetch = |cursor: Option<String>| async move {
            let (_, json) = match cursor {
                None => {
                    let body = json!({
                        "query": keyword,
                        "options": { "path": "", "max_results": SEARCH_LIMIT },
                    });
                    self.rpc("files/search_v2", body).await?
                }
                Some(cursor) => {
                    self.rpc("files/search/continue_v2", json!({ "cursor": cursor }))
                        .await?
                }
            };
            let items = json
                .get("matches")
                .and_then(Value::as_array)
                .map(|matches| {
                    matches
                        .iter()
                        .filter_map(|m| m.get("metadata")?.get("metadata"))
                        .filter_map(item_from_json)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Page::new(items, next_cursor(&json)))
        };
        collect_all(fetch).await
    }
}

#[async_trait]
impl CloudBatching for DropboxProvider {
    async fn remove_items(&self, items: &[CloudItem]) -> CloudResult<RawResponse> {
        let entries: Vec<Value> = items
            .iter()
            .map(|item| json!({ "path": item.path() }))
            .collect();
        let (response, _) = self
            .rpc("files/delete_batch", json!({ "entries": entries }))
            .await?;
        Ok(response)
    }

    async fn move_items(&self, items: &[CloudItem], directory: &CloudItem) -> CloudResult<RawResponse> {
        let entries: Vec<Value> = items
            .iter()
            .map(|item| {
                json!({
                    "from_path": item.path(),
                    "to_path": child_path(directory, &item.name),
                })
            })
            .collect();
        let body = json!({ "entries": entries, "autorename": false });
        let (response, _) = self.rpc("files/move_batch_v2", body).await?;
        Ok(response)
    }
}

/// Dropbox 上传会话协议
///
/// start -> append_v2（游标 = 已发送字节，最后一片 close）-> finish
struct DropboxUpload {
    pipeline: Arc<RequestPipeline>,
    content_api: String,
}

impl DropboxUpload {
    fn content_request(&self, path: &str, arg: &Value) -> HttpRequest {
        HttpRequest::post(format!("{}/files/{}", self.content_api, path))
            .header("Dropbox-API-Arg", api_arg_header(arg))
            .header("Content-Type", "application/octet-stream")
    }
}

#[async_trait]
impl UploadProtocol for DropboxUpload {
    fn name(&self) -> &'static str {
        "dropbox"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Sequential
    }

    async fn initiate(&self, file: &LocalFile, directory: &CloudItem) -> CloudResult<Initiated> {
        let request = self
            .content_request("upload_session/start", &json!({ "close": false }))
            .bytes(Bytes::new());
        let (response, json) = self.pipeline.execute_json(request).await?;
        let session_id = require_str(&json, "session_id", &response)?;
        debug!("Dropbox 上传会话: {}", session_id);
        Ok(Initiated::Session(UploadSession::new(
            file.clone(),
            DROPBOX_PART_SIZE,
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
        let arg = json!({
            "cursor": {
                "session_id": session.continuation.as_str(),
                "offset": part.offset(),
            },
            "close": part.is_last(session.total_size),
        });
        let request = self
            .content_request("upload_session/append_v2", &arg)
            .bytes(data)
            .on_progress(progress);
        self.pipeline.execute(request).await?;
        Ok(PartAck {
            next_offset: Some(part.range.end),
            ..PartAck::default()
        })
    }

    async fn commit(&self, session: &UploadSession) -> CloudResult<UploadResult> {
        let path = join_path(session.target_directory.path(), &session.local_file.name);
        let arg = json!({
            "cursor": {
                "session_id": session.continuation.as_str(),
                "offset": session.total_size,
            },
            "commit": {
                "path": path,
                "mode": "add",
                "autorename": true,
                "mute": false,
                "strict_conflict": false,
            },
        });
        let request = self
            .content_request("upload_session/finish", &arg)
            .bytes(Bytes::new());
        let (response, json) = self.pipeline.execute_json(request).await?;
        let item = item_from_json(&json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))?;
        Ok(UploadResult {
            item,
            response: Some(response),
            rapid_upload: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::http::testing::ScriptedTransport;
    use crate::http::HttpBody;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn provider(transport: Arc<ScriptedTransport>) -> DropboxProvider {
        DropboxProvider::new(ProviderContext::new(Credential::new("u", "token"), transport))
    }

    fn body_json(request: &HttpRequest) -> Value {
        match &request.body {
            HttpBody::Json(value) => value.clone(),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    fn arg_of(request: &HttpRequest) -> Value {
        serde_json::from_str(request.header_value("Dropbox-API-Arg").unwrap()).unwrap()
    }

    #[test]
    fn test_api_arg_header_is_ascii() {
        let header = api_arg_header(&json!({ "path": "/文档/a.txt" }));
        assert!(header.is_ascii());
        assert!(header.contains("\\u6587"));
        let decoded: Value = serde_json::from_str(&header).unwrap();
        assert_eq!(decoded["path"], "/文档/a.txt");

        let emoji = api_arg_header(&json!({ "path": "/😀" }));
        assert!(emoji.contains("\\ud83d\\ude00"));
    }

    #[tokio::test]
    async fn test_list_continues_with_cursor() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({
                "entries": [{".tag": "file", "id": "id:1", "name": "a.txt", "path_display": "/Docs/a.txt", "size": 5}],
                "cursor": "c1",
                "has_more": true
            }),
        );
        transport.push_json(
            200,
            json!({
                "entries": [{".tag": "folder", "id": "id:2", "name": "sub", "path_display": "/Docs/sub"}],
                "cursor": "c2",
                "has_more": false
            }),
        );
        let provider = provider(Arc::clone(&transport));
        let dir = CloudItem::new("id:0", "Docs", "/Docs", true);

        let items = provider.contents_of_directory(&dir).await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path(), "/Docs/a.txt");
        assert!(items[1].is_directory);
        let sent = transport.requests();
        assert!(sent[0].url.ends_with("files/list_folder"));
        assert_eq!(body_json(&sent[0])["path"], "/Docs");
        assert!(sent[1].url.ends_with("files/list_folder/continue"));
        assert_eq!(body_json(&sent[1])["cursor"], "c1");
    }

    #[tokio::test]
    async fn test_rename_keeps_parent_path() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"metadata": {}}));
        let provider = provider(Arc::clone(&transport));
        let item = CloudItem::new("id:1", "a.txt", "/Docs/a.txt", false);

        provider.rename_item(&item, "b.txt").await.unwrap();

        let body = body_json(&transport.requests()[0]);
        assert_eq!(body["from_path"], "/Docs/a.txt");
        assert_eq!(body["to_path"], "/Docs/b.txt");
    }

    #[tokio::test]
    async fn test_error_object_carries_summary() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            409,
            json!({"error_summary": "path/not_found/..", "error": {".tag": "path"}}),
        );
        let provider = provider(Arc::clone(&transport));
        let err = provider
            .remove_item(&CloudItem::new("id:1", "a", "/a", false))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(409));
        assert!(err.to_string().contains("path/not_found"));
    }

    #[tokio::test]
    async fn test_upload_session_append_and_finish() {
        let size = DROPBOX_PART_SIZE as usize + 3;
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"session_id": "sess"}));
        transport.push_json(200, Value::Null);
        transport.push_json(200, Value::Null);
        transport.push_json(
            200,
            json!({"name": "big.bin", "id": "id:9", "path_display": "/Docs/big.bin", "size": size}),
        );
        let provider = provider(Arc::clone(&transport));
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![1u8; size]).unwrap();
        file.flush().unwrap();
        let local = LocalFile::open_named(file.path(), "big.bin").await.unwrap();
        let dir = CloudItem::new("id:0", "Docs", "/Docs", true);

        let result = provider
            .upload_local(local, &dir, UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(result.item.path(), "/Docs/big.bin");
        let sent = transport.requests();
        assert_eq!(sent.len(), 4);
        assert_eq!(arg_of(&sent[1])["cursor"]["offset"], 0);
        assert_eq!(arg_of(&sent[1])["close"], false);
        assert_eq!(arg_of(&sent[2])["cursor"]["offset"], DROPBOX_PART_SIZE);
        assert_eq!(arg_of(&sent[2])["close"], true);
        assert_eq!(sent[2].body.payload_len(), 3);
        let finish = arg_of(&sent[3]);
        assert_eq!(finish["cursor"]["offset"], size);
        assert_eq!(finish["commit"]["path"], "/Docs/big.bin");
        assert_eq!(finish["commit"]["mode"], "add");
    }

    #[tokio::test]
    async fn test_batch_delete_entries() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({".tag": "async_job_id", "async_job_id": "j1"}));
        let provider = provider(Arc::clone(&transport));
        let items = vec![
            CloudItem::new("id:1", "a", "/a", false),
            CloudItem::new("id:2", "b", "/b", false),
        ];

        crate::provider::remove_items(&provider, &items).await.unwrap();

        let body = body_json(&transport.requests()[0]);
        assert_eq!(body["entries"][1]["path"], "/b");
    }
}
