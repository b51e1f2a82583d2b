// Google Drive
//
// 以 id 寻址、父目录关系由 parents 表示；可选共享云端硬盘

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, RawResponse, RequestPipeline, SendProgress};
use crate::provider::classifier::GoogleDriveClassifier;
use crate::provider::{
    collect_all, ensure_success, json_i64, json_str, parse_rfc3339, CloudCopying,
    CloudFileProvider, CloudItem, CloudSearching, CloudSpaceInformation, CloudUser,
    DownloadRequest, Page, ProviderContext, UploadOptions, UploadResult,
};
use crate::uploader::{
    ChunkedUploadEngine, ContinuationToken, Initiated, LocalFile, PartAck, TransferMode,
    UploadPart, UploadProtocol, UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// 分片大小 6MB（256KB 的整数倍）
pub const GOOGLE_DRIVE_PART_SIZE: u64 = 6 * 1024 * 1024;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const LIST_FIELDS: &str =
    "files(id,kind,name,size,createdTime,modifiedTime,mimeType,md5Checksum,parents),nextPageToken";

pub struct GoogleDriveProvider {
    pipeline: Arc<RequestPipeline>,
    api: String,
    upload_api: String,
    /// 共享云端硬盘 id
    shared_drive: Option<String>,
}

impl GoogleDriveProvider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(GoogleDriveClassifier), AuthScheme::Bearer);
        Self {
            pipeline: Arc::new(pipeline),
            api: context.endpoints.google_drive_api.trim_end_matches('/').to_string(),
            upload_api: context
                .endpoints
                .google_drive_upload
                .trim_end_matches('/')
                .to_string(),
            shared_drive: None,
        }
    }

    /// 在共享云端硬盘中操作
    pub fn with_shared_drive(mut self, drive_id: impl Into<String>) -> Self {
        self.shared_drive = Some(drive_id.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api, path)
    }

    fn file_url(&self, item: &CloudItem) -> String {
        self.url(&format!("files/{}", item.id))
    }

    /// 共享云端硬盘需要 supportsAllDrives
    fn scoped(&self, request: HttpRequest) -> HttpRequest {
        if self.shared_drive.is_some() {
            request.query("supportsAllDrives", true)
        } else {
            request
        }
    }

    /// files 列表查询，共享云端硬盘时限定 corpora
    async fn files_page(&self, q: &str, page_token: Option<String>) -> CloudResult<Page<CloudItem>> {
        let mut request = HttpRequest::get(self.url("files"))
            .query("q", q)
            .query("fields", LIST_FIELDS)
            .query("includeItemsFromAllDrives", true)
            .query("supportsAllDrives", true);
        if let Some(drive_id) = &self.shared_drive {
            request = request.query("driveId", drive_id).query("corpora", "drive");
        }
        if let Some(token) = page_token {
            request = request.query("pageToken", token);
        }
        let (_, json) = self.pipeline.execute_json(request).await?;
        let items = json
            .get("files")
            .and_then(Value::as_array)
            .map(|files| files.iter().filter_map(item_from_json).collect())
            .unwrap_or_default();
        Ok(Page::new(items, json_str(&json, "nextPageToken")))
    }

    async fn about(&self, fields: &str) -> CloudResult<(RawResponse, Value)> {
        let request = HttpRequest::get(self.url("about")).query("fields", fields);
        self.pipeline.execute_json(request).await
    }
}

fn item_from_json(json: &Value) -> Option<CloudItem> {
    let id = json_str(json, "id")?;
    let name = json_str(json, "name")?;
    let is_directory = json.get("mimeType").and_then(Value::as_str) == Some(FOLDER_MIME_TYPE);
    let item = CloudItem::new(id, name.clone(), name, is_directory)
        // size 在响应中是字符串
        .with_size(json_i64(json.get("size")).unwrap_or(-1))
        .with_hash(json_str(json, "md5Checksum"))
        .with_times(
            parse_rfc3339(json.get("createdTime")),
            parse_rfc3339(json.get("modifiedTime")),
        )
        .with_raw(json.clone());
    Some(item)
}

/// 查询字符串中的单引号转义
fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// 308 响应 `Range: bytes=0-K` 表示已收到 [0, K]，下一偏移 K+1；无 Range 头时为 0
fn resume_offset(response: &RawResponse) -> u64 {
    response
        .header("Range")
        .and_then(|range| range.rsplit('-').next())
        .and_then(|upper| upper.trim().parse::<u64>().ok())
        .map_or(0, |upper| upper + 1)
}

#[async_trait]
impl CloudFileProvider for GoogleDriveProvider {
    fn name(&self) -> &'static str {
        "GoogleDrive"
    }

    fn root_item(&self) -> CloudItem {
        match &self.shared_drive {
            Some(drive_id) => CloudItem::new(drive_id.clone(), "root", "/", true),
            None => CloudItem::new("root", "root", "/", true),
        }
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem> {
        let request = self.scoped(HttpRequest::get(self.file_url(item)).query("fields", "*"));
        let (response, json) = self.pipeline.execute_json(request).await?;
        item_from_json(&json)
            .map(|found| found.at_path(item.path()))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let q = format!("trashed = false and '{}' in parents", quote(&directory.id));
        let mut items = collect_all(|token| self.files_page(&q, token)).await?;
        for item in &mut items {
            item.fix_path(directory);
        }
        Ok(items)
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({
            "mimeType": FOLDER_MIME_TYPE,
            "name": name,
            "parents": [directory.id],
        });
        let request = self.scoped(HttpRequest::post(self.url("files")).json(body));
        self.pipeline.execute(request).await
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let request = self.scoped(
            HttpRequest::new(Method::PATCH, self.file_url(item)).json(json!({ "name": new_name })),
        );
        self.pipeline.execute(request).await
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let mut request = HttpRequest::new(Method::PATCH, self.file_url(item))
            .query("addParents", &directory.id)
            .json(json!({}));
        let parents: Vec<&str> = item
            .raw_attributes
            .get("parents")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if !parents.is_empty() {
            request = request.query("removeParents", parents.join(","));
        }
        self.pipeline.execute(self.scoped(request)).await
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        let request = self.scoped(HttpRequest::delete(self.file_url(item)));
        self.pipeline.execute(request).await
    }

    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        let mut url = format!("{}?alt=media", self.file_url(item));
        if self.shared_drive.is_some() {
            url.push_str("&supportsAllDrives=true");
        }
        let token = self.credential().token.clone();
        Ok(DownloadRequest::new(url).header("Authorization", format!("Bearer {}", token)))
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        let (response, json) = self.about("user").await?;
        let username = json
            .get("user")
            .and_then(|user| json_str(user, "displayName"))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少用户名", &response))?;
        Ok(CloudUser {
            username,
            raw_attributes: json,
        })
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        let (response, json) = self.about("storageQuota").await?;
        let quota = json
            .get("storageQuota")
            .ok_or_else(|| CloudServiceError::decode("响应中缺少空间信息", &response))?;
        // 无上限的账号不返回 limit
        let limit = json_i64(quota.get("limit")).unwrap_or(0);
        let usage = json_i64(quota.get("usage")).unwrap_or(0);
        Ok(CloudSpaceInformation {
            total_space: limit,
            available_space: (limit - usage).max(0),
            raw_attributes: json,
        })
    }

    async fn upload_local(
        &self,
        file: LocalFile,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        let protocol = GoogleDriveUpload {
            pipeline: Arc::clone(&self.pipeline),
            upload_api: self.upload_api.clone(),
            shared_drive: self.shared_drive.is_some(),
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
impl CloudCopying for GoogleDriveProvider {
    async fn copy_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let url = format!("{}/copy", self.file_url(item));
        let request = self.scoped(HttpRequest::post(url).json(json!({ "parents": [directory.id] })));
        self.pipeline.execute(request).await
    }
}

#[async_trait]
impl CloudSearching for GoogleDriveProvider {
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        let q = format!("name contains '{}' and trashed = false", quote(keyword));
        collect_all(|token| self.files_page(&q, token)).await
    }
}

/// Google Drive 可续传上传协议
///
/// POST uploadType=resumable 从 Location 取会话地址；分片 PUT 返回 308 表示继续，200/201 表示完成
struct GoogleDriveUpload {
    pipeline: Arc<RequestPipeline>,
    upload_api: String,
    shared_drive: bool,
}

#[async_trait]
impl UploadProtocol for GoogleDriveUpload {
    fn name(&self) -> &'static str {
        "google_drive"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Sequential
    }

    async fn initiate(&self, file: &LocalFile, directory: &CloudItem) -> CloudResult<Initiated> {
        let mut request = HttpRequest::post(format!("{}/files", self.upload_api))
            .query("uploadType", "resumable")
            .header("X-Upload-Content-Length", file.size.to_string())
            .json(json!({ "name": file.name, "parents": [directory.id] }));
        if self.shared_drive {
            request = request.query("supportsAllDrives", true);
        }
        let response = ensure_success(self.pipeline.execute(request).await?)?;
        let location = response
            .header("Location")
            .map(str::to_string)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 Location", &response))?;
        debug!("Google Drive 上传会话已创建: {}", file.name);
        Ok(Initiated::Session(UploadSession::new(
            file.clone(),
            GOOGLE_DRIVE_PART_SIZE,
            directory.clone(),
            ContinuationToken::SessionUrl(location),
        )))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part: &UploadPart,
        data: Bytes,
        progress: SendProgress,
    ) -> CloudResult<PartAck> {
        let range = if session.total_size == 0 {
            "bytes */0".to_string()
        } else {
            format!(
                "bytes {}-{}/{}",
                part.range.start,
                part.range.end - 1,
                session.total_size
            )
        };
        let request = HttpRequest::put(session.continuation.as_str())
            .header("Content-Range", range)
            .bytes(data)
            .on_progress(progress);
        let response = self.pipeline.execute(request).await?;

        if response.status() == 308 {
            let next = resume_offset(&response);
            return Ok(PartAck {
                next_offset: Some(next),
                ..PartAck::default()
            });
        }
        let response = ensure_success(response)?;
        Ok(PartAck {
            next_offset: Some(session.total_size),
            completed: Some(response),
            ..PartAck::default()
        })
    }

    async fn commit(&self, session: &UploadSession) -> CloudResult<UploadResult> {
        let response = session.completion.clone().ok_or_else(|| {
            warn!("Google Drive 分片已全部发送但未收到完成响应");
            CloudServiceError::ResponseDecode {
                reason: "未收到上传完成响应".to_string(),
                response: None,
            }
        })?;
        let mut item = response
            .json()
            .as_ref()
            .and_then(item_from_json)
            .ok_or_else(|| CloudServiceError::decode("完成响应中缺少文件信息", &response))?;
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
    use crate::auth::Credential;
    use crate::http::testing::ScriptedTransport;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn provider(transport: Arc<ScriptedTransport>) -> GoogleDriveProvider {
        GoogleDriveProvider::new(ProviderContext::new(Credential::new("u", "token"), transport))
    }

    fn temp_file(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![2u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    fn done(status: u16, value: Value) -> RawResponse {
        RawResponse::from_json(status, &value)
    }

    #[test]
    fn test_resume_offset_from_range_header() {
        let with_range = RawResponse::new(308, Default::default(), Vec::new())
            .with_header("Range", "bytes=0-1048575");
        assert_eq!(resume_offset(&with_range), 1048576);
        let without = RawResponse::new(308, Default::default(), Vec::new());
        assert_eq!(resume_offset(&without), 0);
    }

    #[tokio::test]
    async fn test_list_query_and_page_token() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({
                "files": [{"id": "1", "name": "a.txt", "mimeType": "text/plain", "size": "12"}],
                "nextPageToken": "p2"
            }),
        );
        transport.push_json(
            200,
            json!({"files": [{"id": "2", "name": "dir", "mimeType": FOLDER_MIME_TYPE}]}),
        );
        let provider = provider(Arc::clone(&transport));

        let items = provider
            .contents_of_directory(&provider.root_item())
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].size, 12);
        assert_eq!(items[0].path(), "/a.txt");
        assert!(items[1].is_directory);
        let sent = transport.requests();
        assert_eq!(
            sent[0].query_value("q"),
            Some("trashed = false and 'root' in parents")
        );
        assert_eq!(sent[1].query_value("pageToken"), Some("p2"));
    }

    #[tokio::test]
    async fn test_shared_drive_scopes_queries() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"files": []}));
        let provider = provider(Arc::clone(&transport)).with_shared_drive("SD1");

        provider
            .contents_of_directory(&provider.root_item())
            .await
            .unwrap();

        let sent = transport.requests();
        assert_eq!(sent[0].query_value("driveId"), Some("SD1"));
        assert_eq!(sent[0].query_value("corpora"), Some("drive"));
        assert!(sent[0].query_value("q").unwrap().contains("'SD1' in parents"));
    }

    #[tokio::test]
    async fn test_move_replaces_parents() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"id": "1"}));
        let provider = provider(Arc::clone(&transport));
        let item = CloudItem::new("1", "a", "/a", false).with_raw(json!({"parents": ["P0", "P1"]}));
        let target = CloudItem::new("P2", "t", "/t", true);

        provider.move_item(&item, &target).await.unwrap();

        let sent = transport.requests();
        assert_eq!(sent[0].method, Method::PATCH);
        assert_eq!(sent[0].query_value("addParents"), Some("P2"));
        assert_eq!(sent[0].query_value("removeParents"), Some("P0,P1"));
    }

    #[tokio::test]
    async fn test_error_code_from_body() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            404,
            json!({"error": {"code": 404, "errors": [{"message": "File not found: x"}]}}),
        );
        let provider = provider(Arc::clone(&transport));
        let err = provider
            .attributes_of_item(&CloudItem::new("x", "x", "/x", false))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(404));
        assert!(err.to_string().contains("File not found"));
    }

    #[tokio::test]
    async fn test_resumable_upload_follows_308_range() {
        let size = GOOGLE_DRIVE_PART_SIZE + 100;
        let transport = ScriptedTransport::new();
        transport.push_response(
            RawResponse::new(200, Default::default(), Vec::new())
                .with_header("Location", "https://upload.example.com/session/1"),
        );
        // 服务端只收到前 4096 字节
        transport.push_response(
            RawResponse::new(308, Default::default(), Vec::new()).with_header("Range", "bytes=0-4095"),
        );
        transport.push_response(done(
            200,
            json!({"id": "G1", "name": "big.bin", "mimeType": "application/octet-stream", "size": "6291556"}),
        ));
        let provider = provider(Arc::clone(&transport));
        let file = temp_file(size as usize);
        let local = LocalFile::open_named(file.path(), "big.bin").await.unwrap();

        let result = provider
            .upload_local(local, &provider.root_item(), UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(result.item.id, "G1");
        assert_eq!(result.item.path(), "/big.bin");
        let sent = transport.requests();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].query_value("uploadType"), Some("resumable"));
        assert_eq!(sent[1].url, "https://upload.example.com/session/1");
        assert_eq!(
            sent[2].header_value("Content-Range"),
            Some(format!("bytes 4096-{}/{}", size - 1, size).as_str())
        );
    }

    #[tokio::test]
    async fn test_empty_file_uses_star_range() {
        let transport = ScriptedTransport::new();
        transport.push_response(
            RawResponse::new(200, Default::default(), Vec::new())
                .with_header("Location", "https://upload.example.com/session/2"),
        );
        transport.push_response(done(201, json!({"id": "G2", "name": "empty", "mimeType": "text/plain"})));
        let provider = provider(Arc::clone(&transport));
        let file = temp_file(0);
        let local = LocalFile::open_named(file.path(), "empty").await.unwrap();

        let result = provider
            .upload_local(local, &provider.root_item(), UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(result.item.id, "G2");
        assert_eq!(transport.requests()[1].header_value("Content-Range"), Some("bytes */0"));
    }
}
