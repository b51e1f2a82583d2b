// 阿里云盘
//
// 接口均为 POST JSON；删除与移动走 batch 接口

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, RawResponse, RequestPipeline, SendProgress};
use crate::provider::classifier::AliyunClassifier;
use crate::provider::{
    collect_all, ensure_success, join_path, json_i64, json_str, parse_rfc3339, require_str,
    CloudBatching, CloudFileProvider, CloudItem, CloudSearching, CloudSpaceInformation,
    CloudUser, DownloadRequest, Page, ProviderContext, UploadOptions, UploadResult,
};
use crate::uploader::{
    part_count, ChunkedUploadEngine, ContinuationToken, Initiated, LocalFile, PartAck,
    RapidUploadChecker, TransferMode, UploadPart, UploadProtocol, UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// 分片大小 10MB
pub const ALIYUN_PART_SIZE: u64 = 10 * 1024 * 1024;

/// 单页条数
const PAGE_LIMIT: u32 = 100;

/// 阿里云盘
pub struct AliyunDriveProvider {
    pipeline: Arc<RequestPipeline>,
    api: String,
    /// 默认取用户信息中的 default_drive_id
    drive_id: RwLock<Option<String>>,
}

impl AliyunDriveProvider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(AliyunClassifier), AuthScheme::Bearer);
        Self {
            pipeline: Arc::new(pipeline),
            api: context.endpoints.aliyun_api.trim_end_matches('/').to_string(),
            drive_id: RwLock::new(None),
        }
    }

    /// 指定 drive_id（资源盘等非默认盘）
    pub fn with_drive_id(self, drive_id: impl Into<String>) -> Self {
        *self.drive_id.write() = Some(drive_id.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api, path)
    }

    async fn post(&self, path: &str, body: Value) -> CloudResult<(RawResponse, Value)> {
        self.pipeline
            .execute_json(HttpRequest::post(self.url(path)).json(body))
            .await
    }

    async fn drive_id(&self) -> CloudResult<String> {
        if let Some(drive_id) = self.drive_id.read().clone() {
            return Ok(drive_id);
        }
        let (response, json) = self.post("v2/user/get", json!({})).await?;
        let drive_id = require_str(&json, "default_drive_id", &response)?;
        debug!("阿里云盘默认 drive_id: {}", drive_id);
        *self.drive_id.write() = Some(drive_id.clone());
        Ok(drive_id)
    }

    async fn list_page(
        &self,
        drive_id: &str,
        parent_file_id: &str,
        marker: Option<String>,
    ) -> CloudResult<Page<CloudItem>> {
        let mut body = json!({
            "all": false,
            "drive_id": drive_id,
            "fields": "*",
            "limit": PAGE_LIMIT,
            "order_by": "updated_at",
            "order_direction": "DESC",
            "parent_file_id": parent_file_id,
        });
        if let Some(marker) = marker {
            body["marker"] = Value::String(marker);
        }
        let (_, json) = self.post("adrive/v3/file/list", body).await?;
        Ok(Page::new(items_of(&json, "items"), json_str(&json, "next_marker")))
    }

    async fn batch(&self, requests: Vec<Value>) -> CloudResult<RawResponse> {
        let body = json!({ "resource": "file", "requests": requests });
        self.pipeline
            .execute(HttpRequest::post(self.url("v3/batch")).json(body))
            .await
    }

    fn batch_request(id: &str, url: &str, body: Value) -> Value {
        json!({
            "id": id,
            "method": "POST",
            "url": url,
            "headers": { "Content-Type": "application/json" },
            "body": body,
        })
    }
}

/// JSON 转 CloudItem（路径暂为文件名，由调用方补全）
fn item_from_json(json: &Value) -> Option<CloudItem> {
    let id = json_str(json, "file_id")?;
    let name = json_str(json, "name").or_else(|| json_str(json, "file_name"))?;
    let is_directory = json.get("type").and_then(Value::as_str) == Some("folder");
    let mut item = CloudItem::new(id, name.clone(), name, is_directory)
        .with_times(
            parse_rfc3339(json.get("created_at")),
            parse_rfc3339(json.get("updated_at")),
        )
        .with_raw(json.clone());
    if !is_directory {
        item = item
            .with_size(json_i64(json.get("size")).unwrap_or(-1))
            .with_hash(json_str(json, "content_hash"));
    }
    Some(item)
}

fn items_of(json: &Value, key: &str) -> Vec<CloudItem> {
    json.get(key)
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(item_from_json).collect())
        .unwrap_or_default()
}

#[async_trait]
impl CloudFileProvider for AliyunDriveProvider {
    fn name(&self) -> &'static str {
        "AliyunDrive"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("root", "root", "/", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem> {
        let drive_id = self.drive_id().await?;
        let (response, json) = self
            .post("v2/file/get", json!({ "drive_id": drive_id, "file_id": item.id }))
            .await?;
        item_from_json(&json)
            .map(|found| found.at_path(item.path()))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let drive_id = self.drive_id().await?;
        let drive_id = drive_id.as_str();
        let parent = directory.id.as_str();
        let mut items = collect_all(move |marker| self.list_page(drive_id, parent, marker)).await?;
        for item in &mut items {
            item.fix_path(directory);
        }
        Ok(items)
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let drive_id = self.drive_id().await?;
        let body = json!({
            "drive_id": drive_id,
            "parent_file_id": directory.id,
            "name": name,
            "type": "folder",
            "check_name_mode": "refuse",
        });
        let (response, _) = self.post("adrive/v2/file/createWithFolders", body).await?;
        Ok(response)
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let drive_id = self.drive_id().await?;
        let body = json!({
            "drive_id": drive_id,
            "file_id": item.id,
            "name": new_name,
            "check_name_mode": "refuse",
        });
        let (response, _) = self.post("v3/file/update", body).await?;
        Ok(response)
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        self.move_items(std::slice::from_ref(item), directory).await
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        self.remove_items(std::slice::from_ref(item)).await
    }

    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        let drive_id = self.drive_id().await?;
        let (response, json) = self
            .post(
                "v2/file/get_download_url",
                json!({ "drive_id": drive_id, "file_id": item.id }),
            )
            .await?;
        let url = require_str(&json, "url", &response)?;
        Ok(DownloadRequest::new(url).header("Referer", "https://www.aliyundrive.com/"))
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        let (response, json) = self.post("v2/user/get", json!({})).await?;
        let username = json_str(&json, "nick_name")
            .or_else(|| json_str(&json, "user_name"))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少用户名", &response))?;
        if let Some(drive_id) = json_str(&json, "default_drive_id") {
            self.drive_id.write().get_or_insert(drive_id);
        }
        Ok(CloudUser {
            username,
            raw_attributes: json,
        })
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        let (response, json) = self.post("v2/databox/get_personal_info", json!({})).await?;
        let info = json
            .get("personal_space_info")
            .ok_or_else(|| CloudServiceError::decode("响应中缺少空间信息", &response))?;
        let total = json_i64(info.get("total_size")).unwrap_or(0);
        let used = json_i64(info.get("used_size")).unwrap_or(0);
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
        let protocol = AliyunUpload {
            pipeline: Arc::clone(&self.pipeline),
            api: self.api.clone(),
            drive_id: self.drive_id().await?,
        };
        ChunkedUploadEngine::new(Arc::new(protocol), options)
            .upload(file, directory)
            .await
    }

    fn as_searching(&self) -> Option<&dyn CloudSearching> {
        Some(self)
    }

    fn as_batching(&self) -> Option<&dyn CloudBatching> {
        Some(self)
    }
}

#[async_trait]
impl CloudSearching for AliyunDriveProvider {
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        let drive_id = self.drive_id().await?;
        let query = format!("name match \"{}\"", keyword.replace('"', "\\\""));
        let fetch = |marker: Option<String>| {
            let mut body = json!({
                "drive_id": drive_id,
                "limit": PAGE_LIMIT,
                "order_by": "updated_at DESC",
                "query": query,
            });
            if let Some(marker) = marker {
                body["marker"] = Value::String(marker);
            }
            async move {
                let (_, json) = self.post("adrive/v3/file/search", body).await?;
                Ok(Page::new(items_of(&json, "items"), json_str(&json, "next_marker")))
            }
        };
        collect_all(fetch).await
    }
}

#[async_trait]
impl CloudBatching for AliyunDriveProvider {
    async fn remove_items(&self, items: &[CloudItem]) -> CloudResult<RawResponse> {
        let drive_id = self.drive_id().await?;
        let requests = items
            .iter()
            .map(|item| {
                Self::batch_request(
                    &item.id,
                    "/recyclebin/trash",
                    json!({ "drive_id": drive_id, "file_id": item.id }),
                )
            })
            .collect();
        self.batch(requests).await
    }

    async fn move_items(&self, items: &[CloudItem], directory: &CloudItem) -> CloudResult<RawResponse> {
        let drive_id = self.drive_id().await?;
        let requests = items
            .iter()
            .map(|item| {
                Self::batch_request(
                    &item.id,
                    "/file/move",
                    json!({
                        "drive_id": drive_id,
                        "file_id": item.id,
                        "to_drive_id": drive_id,
                        "to_parent_file_id": directory.id,
                    }),
                )
            })
            .collect();
        self.batch(requests).await
    }
}

/// 阿里云盘上传协议
///
/// 1KB 预哈希预检 -> 命中时带 proof_code 全量哈希秒传 -> 逐个 PUT 预签名分片地址 -> complete
struct AliyunUpload {
    pipeline: Arc<RequestPipeline>,
    api: String,
    drive_id: String,
}

impl AliyunUpload {
    async fn create(&self, body: Value) -> CloudResult<(RawResponse, Value)> {
        let url = format!("{}/adrive/v2/file/createWithFolders", self.api);
        self.pipeline
            .execute_json(HttpRequest::post(url).json(body))
            .await
    }
}

#[async_trait]
impl UploadProtocol for AliyunUpload {
    fn name(&self) -> &'static str {
        "aliyun"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Sequential
    }

    async fn initiate(&self, file: &LocalFile, directory: &CloudItem) -> CloudResult<Initiated> {
        let hash = RapidUploadChecker::calculate_hash(&file.path).await?;
        let parts: Vec<Value> = (1..=part_count(file.size, ALIYUN_PART_SIZE))
            .map(|n| json!({ "part_number": n }))
            .collect();

        let mut body = json!({
            "drive_id": self.drive_id,
            "name": file.name,
            "size": file.size,
            "check_name_mode": "auto_rename",
            "parent_file_id": directory.id,
            "type": "file",
            "part_info_list": parts,
            "pre_hash": hash.pre_hash,
        });
        let (mut response, mut json) = self.create(body.clone()).await?;

        if json_str(&json, "code").as_deref() == Some("PreHashMatched") {
            info!("阿里云盘预哈希命中，尝试秒传: {}", file.name);
            let token = self.pipeline.credential().token.clone();
            let proof_code =
                RapidUploadChecker::calculate_proof_code(&file.path, file.size, &token).await?;
            if let Some(map) = body.as_object_mut() {
                map.remove("pre_hash");
                map.insert("content_hash".to_string(), json!(hash.content_sha1));
                map.insert("content_hash_name".to_string(), json!("sha1"));
                map.insert("proof_version".to_string(), json!("v1"));
                map.insert("proof_code".to_string(), json!(proof_code));
            }
            (response, json) = self.create(body).await?;
        }

        let file_id = require_str(&json, "file_id", &response)?;
        let path = join_path(directory.path(), &file.name);

        if json.get("rapid_upload").and_then(Value::as_bool) == Some(true) {
            info!("阿里云盘秒传成功: {}", file.name);
            let name = json_str(&json, "file_name").unwrap_or_else(|| file.name.clone());
            let item = CloudItem::new(file_id, name, path, false)
                .with_size(file.size as i64)
                .with_hash(Some(hash.content_sha1))
                .with_raw(json);
            return Ok(Initiated::Completed(UploadResult {
                item,
                response: Some(response),
                rapid_upload: true,
            }));
        }

        let upload_id = require_str(&json, "upload_id", &response)?;
        let part_info = json.get("part_info_list").cloned().unwrap_or(Value::Null);
        Ok(Initiated::Session(
            UploadSession::new(
                file.clone(),
                ALIYUN_PART_SIZE,
                directory.clone(),
                ContinuationToken::UploadId(upload_id),
            )
            .with_remote_file_id(file_id)
            .with_extra(part_info),
        ))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part: &UploadPart,
        data: Bytes,
        progress: SendProgress,
    ) -> CloudResult<PartAck> {
        let upload_url = session
            .extra
            .as_array()
            .and_then(|list| {
                list.iter().find(|info| {
                    json_i64(info.get("part_number")) == Some(part.part_number as i64)
                })
            })
            .and_then(|info| json_str(info, "upload_url"))
            .ok_or_else(|| CloudServiceError::ResponseDecode {
                reason: format!("缺少分片 #{} 的上传地址", part.part_number),
                response: None,
            })?;

        // 预签名地址：不带凭证，Content-Type 必须为空
        let request = HttpRequest::put(upload_url)
            .unauthenticated()
            .header("Content-Type", "")
            .bytes(data)
            .on_progress(progress);
        let response = ensure_success(self.pipeline.execute(request).await?)?;
        Ok(PartAck {
            etag: response.header("ETag").map(str::to_string),
            ..PartAck::default()
        })
    }

    async fn commit(&self, session: &UploadSession) -> CloudResult<UploadResult> {
        let url = format!("{}/v2/file/complete", self.api);
        let body = json!({
            "drive_id": self.drive_id,
            "file_id": session.remote_file_id,
            "upload_id": session.continuation.as_str(),
        });
        let (response, json) = self
            .pipeline
            .execute_json(HttpRequest::post(url).json(body))
            .await?;
        let mut item = item_from_json(&json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))?;
        item.fix_path(&session.target_directory);
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
    use crate::auth::{refresh_fn, Credential};
    use crate::http::testing::ScriptedTransport;
    use crate::http::HttpBody;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn provider(transport: Arc<ScriptedTransport>) -> AliyunDriveProvider {
        let context = ProviderContext::new(
            Credential::new("user", "token").with_refresh_token("refresh"),
            transport,
        );
        AliyunDriveProvider::new(context).with_drive_id("d1")
    }

    fn body_json(request: &HttpRequest) -> Value {
        match &request.body {
            HttpBody::Json(value) => value.clone(),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_follows_next_marker() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({"items": [{"file_id": "f1", "name": "a.txt", "type": "file", "size": 3}], "next_marker": "m1"}),
        );
        transport.push_json(
            200,
            json!({"items": [{"file_id": "f2", "name": "docs", "type": "folder"}], "next_marker": ""}),
        );
        let provider = provider(Arc::clone(&transport));
        let dir = CloudItem::new("p1", "data", "/data", true);

        let items = provider.contents_of_directory(&dir).await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path(), "/data/a.txt");
        assert_eq!(items[0].size, 3);
        assert!(items[1].is_directory);
        assert_eq!(items[1].size, -1);
        let sent = transport.requests();
        assert_eq!(body_json(&sent[0])["parent_file_id"], "p1");
        assert!(body_json(&sent[0]).get("marker").is_none());
        assert_eq!(body_json(&sent[1])["marker"], "m1");
    }

    #[tokio::test]
    async fn test_drive_id_fetched_lazily() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"default_drive_id": "d9", "nick_name": "n"}));
        transport.push_json(200, json!({"items": []}));
        transport.push_json(200, json!({"items": []}));
        let context = ProviderContext::new(Credential::new("user", "token"), Arc::clone(&transport) as _);
        let provider = AliyunDriveProvider::new(context);
        let root = provider.root_item();

        provider.contents_of_directory(&root).await.unwrap();
        provider.contents_of_directory(&root).await.unwrap();

        let sent = transport.requests();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].url.ends_with("v2/user/get"));
        assert_eq!(body_json(&sent[2])["drive_id"], "d9");
    }

    #[tokio::test]
    async fn test_remove_refreshes_once_after_401() {
        let transport = ScriptedTransport::new();
        transport.push_json(401, json!({"code": "AccessTokenInvalid", "message": "expired"}));
        transport.push_json(200, json!({"responses": [{"id": "f1", "status": 204}]}));
        let handler = refresh_fn(|_| async { Ok(Credential::new("user", "token2")) });
        let context = ProviderContext::new(Credential::new("user", "token"), Arc::clone(&transport) as _)
            .with_refresh_handler(handler);
        let provider = AliyunDriveProvider::new(context).with_drive_id("d1");

        let item = CloudItem::new("f1", "a.txt", "/a.txt", false);
        let response = provider.remove_item(&item).await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(provider.pipeline().refresh_count(), 1);
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].header_value("Authorization"), Some("Bearer token2"));
        let request = &body_json(&sent[1])["requests"][0];
        assert_eq!(request["url"], "/recyclebin/trash");
        assert_eq!(request["body"]["file_id"], "f1");
    }

    #[tokio::test]
    async fn test_rename_conflict_classified_consistently() {
        let transport = ScriptedTransport::new();
        for _ in 0..2 {
            transport.push_json(400, json!({"code": "AlreadyExist.File", "message": "exists"}));
        }
        let provider = provider(Arc::clone(&transport));
        let item = CloudItem::new("f1", "a.txt", "/a.txt", false);

        let first = provider.rename_item(&item, "b.txt").await.unwrap_err();
        let second = provider.rename_item(&item, "b.txt").await.unwrap_err();
        assert_eq!(first.kind(), second.kind());
        assert_eq!(first.code(), second.code());
        assert!(first.response().is_some());
    }

    #[tokio::test]
    async fn test_move_uses_batch_endpoint() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"responses": []}));
        let provider = provider(Arc::clone(&transport));
        let items = vec![
            CloudItem::new("f1", "a", "/a", false),
            CloudItem::new("f2", "b", "/b", false),
        ];
        let target = CloudItem::new("p2", "t", "/t", true);

        crate::provider::move_items(&provider, &items, &target).await.unwrap();

        let body = body_json(&transport.requests()[0]);
        assert_eq!(body["requests"].as_array().unwrap().len(), 2);
        assert_eq!(body["requests"][1]["body"]["to_parent_file_id"], "p2");
        assert_eq!(body["requests"][1]["url"], "/file/move");
    }

    #[tokio::test]
    async fn test_space_and_download() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({"personal_space_info": {"total_size": 1000, "used_size": 250}}),
        );
        transport.push_json(200, json!({"url": "https://cdn.example.com/f1"}));
        let provider = provider(Arc::clone(&transport));

        let space = provider.space_information().await.unwrap();
        assert_eq!(space.total_space, 1000);
        assert_eq!(space.available_space, 750);

        let download = provider
            .download_request(&CloudItem::new("f1", "a", "/a", false))
            .await
            .unwrap();
        assert_eq!(download.url, "https://cdn.example.com/f1");
        assert_eq!(download.headers[0].0, "Referer");
    }

    fn temp_file(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![5u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_prehash_match_then_rapid_upload() {
        let transport = ScriptedTransport::new();
        transport.push_json(409, json!({"code": "PreHashMatched", "message": "matched"}));
        transport.push_json(
            200,
            json!({"file_id": "f9", "file_name": "blob.bin", "upload_id": "u9", "rapid_upload": true}),
        );
        let provider = provider(Arc::clone(&transport));
        let file = temp_file(2048);
        let local = LocalFile::open_named(file.path(), "blob.bin").await.unwrap();

        let result = provider
            .upload_local(local, &provider.root_item(), UploadOptions::default())
            .await
            .unwrap();

        assert!(result.rapid_upload);
        assert_eq!(result.item.id, "f9");
        assert_eq!(result.item.path(), "/blob.bin");
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        let first = body_json(&sent[0]);
        assert!(first.get("pre_hash").is_some());
        let second = body_json(&sent[1]);
        assert!(second.get("pre_hash").is_none());
        assert_eq!(second["content_hash_name"], "sha1");
        assert_eq!(second["proof_version"], "v1");
        assert!(!second["proof_code"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_parts_to_presigned_urls() {
        let size = (ALIYUN_PART_SIZE + 100) as usize;
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({
                "file_id": "f1",
                "upload_id": "u1",
                "rapid_upload": false,
                "part_info_list": [
                    {"part_number": 1, "upload_url": "https://oss.example.com/p1"},
                    {"part_number": 2, "upload_url": "https://oss.example.com/p2"}
                ]
            }),
        );
        transport.push_response(RawResponse::new(200, Default::default(), Vec::new()).with_header("ETag", "e1"));
        transport.push_response(RawResponse::new(200, Default::default(), Vec::new()).with_header("ETag", "e2"));
        transport.push_json(
            200,
            json!({"file_id": "f1", "name": "big.bin", "type": "file", "size": size}),
        );
        let provider = provider(Arc::clone(&transport));
        let file = temp_file(size);
        let local = LocalFile::open_named(file.path(), "big.bin").await.unwrap();
        let dir = CloudItem::new("p1", "data", "/data", true);

        let result = provider
            .upload_local(local, &dir, UploadOptions::default())
            .await
            .unwrap();

        assert!(!result.rapid_upload);
        assert_eq!(result.item.path(), "/data/big.bin");
        assert_eq!(result.item.size, size as i64);
        let sent = transport.requests();
        assert_eq!(sent.len(), 4);
        assert_eq!(body_json(&sent[0])["part_info_list"].as_array().unwrap().len(), 2);
        assert_eq!(sent[1].url, "https://oss.example.com/p1");
        assert!(!sent[1].authorize);
        assert_eq!(sent[1].header_value("Content-Type"), Some(""));
        assert_eq!(sent[2].body.payload_len(), 100);
        let complete = body_json(&sent[3]);
        assert_eq!(complete["upload_id"], "u1");
        assert_eq!(complete["file_id"], "f1");
    }

    #[tokio::test]
    async fn test_presigned_put_failure_is_service_error() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({
                "file_id": "f1",
                "upload_id": "u1",
                "part_info_list": [{"part_number": 1, "upload_url": "https://oss.example.com/p1"}]
            }),
        );
        transport.push_response(RawResponse::new(
            403,
            Default::default(),
            b"<Error><Code>AccessDenied</Code></Error>".to_vec(),
        ));
        let provider = provider(Arc::clone(&transport));
        let file = temp_file(10);
        let local = LocalFile::open(file.path()).await.unwrap();

        let err = provider
            .upload_local(local, &provider.root_item(), UploadOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some(403));
        assert_eq!(transport.request_count(), 2);
    }
}
