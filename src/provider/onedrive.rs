// OneDrive（Microsoft Graph）
//
// 驱动器可以是个人、指定 drive、群组、站点或用户的驱动器

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, RawResponse, RequestPipeline, SendProgress};
use crate::provider::classifier::OneDriveClassifier;
use crate::provider::{
    collect_all, ensure_success, join_path, json_i64, json_str, parse_rfc3339, require_str,
    upload_in_one_request, CloudCopying, CloudFileProvider, CloudItem, CloudSearching,
    CloudSpaceInformation, CloudUser, DownloadRequest, Page, ProviderContext, UploadOptions,
    UploadResult,
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
use tracing::{debug, info};

/// 分片大小 5MB（320KB 的整数倍）
pub const ONEDRIVE_PART_SIZE: u64 = 5 * 1024 * 1024;

/// 小于该大小的文件直接 PUT 内容
pub const ONEDRIVE_SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;

/// 驱动器路由
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OneDriveRoute {
    #[default]
    Me,
    Drive(String),
    Group(String),
    Site(String),
    User(String),
}

impl OneDriveRoute {
    pub fn path(&self) -> String {
        match self {
            OneDriveRoute::Me => "me/drive".to_string(),
            OneDriveRoute::Drive(id) => format!("drives/{}", id),
            OneDriveRoute::Group(id) => format!("groups/{}/drive", id),
            OneDriveRoute::Site(id) => format!("sites/{}/drive", id),
            OneDriveRoute::User(id) => format!("users/{}/drive", id),
        }
    }
}

pub struct OneDriveProvider {
    pipeline: Arc<RequestPipeline>,
    api: String,
    route: OneDriveRoute,
}

impl OneDriveProvider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(OneDriveClassifier), AuthScheme::Bearer);
        Self {
            pipeline: Arc::new(pipeline),
            api: context.endpoints.onedrive_api.trim_end_matches('/').to_string(),
            route: OneDriveRoute::Me,
        }
    }

    pub fn with_route(mut self, route: OneDriveRoute) -> Self {
        self.route = route;
        self
    }

    fn drive_url(&self) -> String {
        format!("{}/{}", self.api, self.route.path())
    }

    fn item_url(&self, item: &CloudItem) -> String {
        if item.id == "root" {
            format!("{}/root", self.drive_url())
        } else {
            format!("{}/items/{}", self.drive_url(), item.id)
        }
    }

    /// `{目录}:/{文件名}:/{动作}`
    fn child_action_url(&self, directory: &CloudItem, name: &str, action: &str) -> String {
        format!(
            "{}:/{}:/{}",
            self.item_url(directory),
            urlencoding::encode(name),
            action
        )
    }

    /// 首页为 `url`，之后跟随 `@odata.nextLink`
    async fn link_page(&self, url: &str, next_link: Option<String>) -> CloudResult<Page<CloudItem>> {
        let request = HttpRequest::get(next_link.unwrap_or_else(|| url.to_string()));
        let (_, json) = self.pipeline.execute_json(request).await?;
        let items = json
            .get("value")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(item_from_json).collect())
            .unwrap_or_default();
        Ok(Page::new(items, json_str(&json, "@odata.nextLink")))
    }
}

fn item_from_json(json: &Value) -> Option<CloudItem> {
    let id = json_str(json, "id")?;
    let name = json_str(json, "name")?;
    let is_directory = json.get("folder").is_some();
    let parent_path = json
        .get("parentReference")
        .and_then(|parent| parent.get("path"))
        .and_then(Value::as_str)
        .map(|path| {
            let decoded = urlencoding::decode(path)
                .map(|p| p.into_owned())
                .unwrap_or_else(|_| path.to_string());
            match decoded.find("root:") {
                Some(index) => decoded[index + "root:".len()..].to_string(),
                None => decoded,
            }
        });
    let hash = json
        .get("file")
        .and_then(|file| file.get("hashes"))
        .and_then(|hashes| json_str(hashes, "sha1Hash"));

    let mut item = CloudItem::new(id, name.clone(), name.clone(), is_directory)
        .with_size(if is_directory {
            -1
        } else {
            json_i64(json.get("size")).unwrap_or(-1)
        })
        .with_hash(hash)
        .with_times(
            parse_rfc3339(json.get("createdDateTime")),
            parse_rfc3339(json.get("lastModifiedDateTime")),
        )
        .with_raw(json.clone());
    if let Some(parent) = parent_path {
        let parent = if parent.is_empty() { "/".to_string() } else { parent };
        item = item.at_path(join_path(&parent, &name));
    }
    Some(item)
}

/// 完成上传的响应体带 `id` 与 `file`
fn completed_item(json: &Value) -> Option<CloudItem> {
    if json.get("id").is_some() && json.get("file").is_some() {
        item_from_json(json)
    } else {
        None
    }
}

/// `nextExpectedRanges[0]` 的起始偏移（形如 "26-" 或 "26-100"）
fn next_expected_offset(json: &Value) -> Option<u64> {
    json.get("nextExpectedRanges")?
        .get(0)?
        .as_str()?
        .split('-')
        .next()?
        .parse()
        .ok()
}

#[async_trait]
impl CloudFileProvider for OneDriveProvider {
    fn name(&self) -> &'static str {
        "OneDrive"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("root", "root", "/", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem> {
        let (response, json) = self
            .pipeline
            .execute_json(HttpRequest::get(self.item_url(item)))
            .await?;
        item_from_json(&json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let url = format!("{}/children", self.item_url(directory));
        let mut items = collect_all(|link| self.link_page(&url, link)).await?;
        for item in &mut items {
            item.fix_path(directory);
        }
        Ok(items)
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "rename",
        });
        let url = format!("{}/children", self.item_url(directory));
        self.pipeline.execute(HttpRequest::post(url).json(body)).await
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let request =
            HttpRequest::new(Method::PATCH, self.item_url(item)).json(json!({ "name": new_name }));
        self.pipeline.execute(request).await
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({ "name": item.name, "parentReference": { "id": directory.id } });
        let request = HttpRequest::new(Method::PATCH, self.item_url(item)).json(body);
        self.pipeline.execute(request).await
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        self.pipeline
            .execute(HttpRequest::delete(self.item_url(item)))
            .await
    }

    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        let (response, json) = self
            .pipeline
            .execute_json(HttpRequest::get(self.item_url(item)))
            .await?;
        let url = require_str(&json, "@microsoft.graph.downloadUrl", &response)?;
        Ok(DownloadRequest::new(url))
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        let url = format!("{}/me", self.api);
        let (response, json) = self.pipeline.execute_json(HttpRequest::get(url)).await?;
        let username = require_str(&json, "displayName", &response)?;
        Ok(CloudUser {
            username,
            raw_attributes: json,
        })
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        let (response, json) = self
            .pipeline
            .execute_json(HttpRequest::get(self.drive_url()))
            .await?;
        let quota = json
            .get("quota")
            .ok_or_else(|| CloudServiceError::decode("响应中缺少空间信息", &response))?;
        let total = json_i64(quota.get("total")).unwrap_or(0);
        let remaining = json_i64(quota.get("remaining")).unwrap_or(0);
        Ok(CloudSpaceInformation {
            total_space: total,
            available_space: remaining,
            raw_attributes: json,
        })
    }

    async fn upload_local(
        &self,
        file: LocalFile,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        if file.size < ONEDRIVE_SIMPLE_UPLOAD_LIMIT {
            let url = self.child_action_url(directory, &file.name, "content");
            let response = upload_in_one_request(&self.pipeline, &file, &options, move |data| {
                HttpRequest::put(url).with_body(data)
            })
            .await?;
            let mut item = response
                .json()
                .as_ref()
                .and_then(item_from_json)
                .ok_or_else(|| CloudServiceError::decode("响应中缺少上传后的文件", &response))?;
            item.fix_path(directory);
            return Ok(UploadResult {
                item,
                response: Some(response),
                rapid_upload: false,
            });
        }

        let protocol = OneDriveUpload {
            pipeline: Arc::clone(&self.pipeline),
            session_url: self.child_action_url(directory, &file.name, "createUploadSession"),
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
impl CloudCopying for OneDriveProvider {
    async fn copy_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let url = format!("{}/copy", self.item_url(item));
        let body = json!({ "parentReference": { "id": directory.id } });
        self.pipeline.execute(HttpRequest::post(url).json(body)).await
    }
}

#[async_trait]
impl CloudSearching for OneDriveProvider {
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        // OData 字符串中的单引号写两次
        let query = keyword.replace('\'', "''");
        let url = format!(
            "{}/root/search(q='{}')",
            self.drive_url(),
            urlencoding::encode(&query)
        );
        collect_all(|link| self.link_page(&url, link)).await
    }
}

/// OneDrive 上传会话协议
///
/// createUploadSession 得到 uploadUrl；分片 PUT 不带凭证，服务端用 nextExpectedRanges 指示下一偏移，
/// 最后一个分片的响应即为上传完成的文件
struct OneDriveUpload {
    pipeline: Arc<RequestPipeline>,
    session_url: String,
}

#[async_trait]
impl UploadProtocol for OneDriveUpload {
    fn name(&self) -> &'static str {
        "onedrive"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Sequential
    }

    async fn initiate(&self, file: &LocalFile, directory: &CloudItem) -> CloudResult<Initiated> {
        let body = json!({ "item": { "@microsoft.graph.conflictBehavior": "rename" } });
        let (response, json) = self
            .pipeline
            .execute_json(HttpRequest::post(self.session_url.clone()).json(body))
            .await?;
        let upload_url = require_str(&json, "uploadUrl", &response)?;
        debug!("OneDrive 上传会话已创建: {}", file.name);
        Ok(Initiated::Session(UploadSession::new(
            file.clone(),
            ONEDRIVE_PART_SIZE,
            directory.clone(),
            ContinuationToken::SessionUrl(upload_url),
        )))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part: &UploadPart,
        data: Bytes,
        progress: SendProgress,
    ) -> CloudResult<PartAck> {
        let range = format!(
            "bytes {}-{}/{}",
            part.range.start,
            part.range.end.saturating_sub(1),
            session.total_size
        );
        let request = HttpRequest::put(session.continuation.as_str())
            .unauthenticated()
            .header("Content-Range", range)
            .bytes(data)
            .on_progress(progress);
        let response = ensure_success(self.pipeline.execute(request).await?)?;
        let json = response.json().unwrap_or(Value::Null);

        if completed_item(&json).is_some() {
            return Ok(PartAck {
                next_offset: Some(session.total_size),
                completed: Some(response),
                ..PartAck::default()
            });
        }
        Ok(PartAck {
            next_offset: next_expected_offset(&json),
            ..PartAck::default()
        })
    }

    async fn commit(&self, session: &UploadSession) -> CloudResult<UploadResult> {
        let response = session.completion.clone().ok_or_else(|| {
            CloudServiceError::ResponseDecode {
                reason: "所有分片已上传但未收到完成响应".to_string(),
                response: None,
            }
        })?;
        let mut item = response
            .json()
            .as_ref()
            .and_then(completed_item)
            .ok_or_else(|| CloudServiceError::decode("完成响应中缺少文件信息", &response))?;
        item.fix_path(&session.target_directory);
        Ok(UploadResult {
            item,
            response: Some(response),
            rapid_upload: false,
        })
    }

    async fn abort(&self, session: &UploadSession) -> CloudResult<()> {
        let request = HttpRequest::delete(session.continuation.as_str()).unauthenticated();
        self.pipeline.execute(request).await?;
        info!("OneDrive 上传会话已取消: {}", session.local_file.name);
        Ok(())
    }
}
