// 115 网盘网页版
//
// 使用浏览器登录后的 Cookie 调用 webapi.115.com；修改类接口均为表单 POST

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, RawResponse, RequestPipeline};
use crate::provider::classifier::Drive115WebClassifier;
use crate::provider::{
    collect_all, join_path, json_i64, json_str, parse_timestamp, CloudBatching, CloudFileProvider,
    CloudItem, CloudSearching, CloudSpaceInformation, CloudUser, DownloadRequest, Page,
    ProviderContext, UploadOptions, UploadResult,
};
use crate::uploader::LocalFile;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

const PAGE_LIMIT: i64 = 1000;
const SEARCH_LIMIT: i64 = 50;

/// webapi 拒绝按上传时间排序时返回的错误码，改用 aps 的自然排序接口
const NATSORT_REQUIRED: i64 = 20130827;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/49.0.2623.75 Safari/537.36 115Browser/7.2.5";

pub struct Drive115WebProvider {
    pipeline: Arc<RequestPipeline>,
    web_api: String,
    aps_api: String,
}

impl Drive115WebProvider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(Drive115WebClassifier), AuthScheme::Cookie);
        Self {
            pipeline: Arc::new(pipeline),
            web_api: context.endpoints.drive115_web_api.trim_end_matches('/').to_string(),
            aps_api: context.endpoints.drive115_aps_api.trim_end_matches('/').to_string(),
        }
    }

    fn browser(request: HttpRequest) -> HttpRequest {
        request
            .header("Accept", "application/json, text/plain, */*")
            .header("Origin", "https://115.com")
            .header("Referer", "https://115.com/")
            .header("User-Agent", USER_AGENT)
    }

    fn get(&self, base: &str, path: &str) -> HttpRequest {
        Self::browser(HttpRequest::get(format!("{}{}", base, path)))
    }

    async fn post_form(&self, path: &str, fields: Vec<(String, String)>) -> CloudResult<RawResponse> {
        let request = Self::browser(HttpRequest::post(format!("{}{}", self.web_api, path)));
        self.pipeline.execute(request.form(fields)).await
    }

    /// 按 offset 翻页，`count` 为目录下总数
    async fn list_page(
        &self,
        directory: &CloudItem,
        offset: Option<String>,
        natsort: bool,
    ) -> CloudResult<Page<CloudItem>> {
        let offset: i64 = offset.and_then(|o| o.parse().ok()).unwrap_or(0);
        let request = if natsort {
            self.get(&self.aps_api, "/natsort/files.php")
                .query("o", "file_name")
                .query("asc", 1)
        } else {
            self.get(&self.web_api, "/files")
                .query("o", "user_ptime")
                .query("asc", 0)
        };
        let mut request = request
            .query("aid", 1)
            .query("cid", &directory.id)
            .query("offset", offset)
            .query("show_dir", 1)
            .query("limit", PAGE_LIMIT)
            .query("code", "")
            .query("scid", "")
            .query("snap", 0)
            .query("natsort", 1)
            .query("record_open_time", 1)
            .query("source", "")
            .query("format", "json");
        if natsort {
            for key in ["type", "star", "is_share", "suffix", "custom_order", "is_q"] {
                request = request.query(key, "");
            }
            request = request.query("fc_mix", 0);
        }

        let (response, json) = self.pipeline.execute_json(request).await?;
        let items = items_of_data(&json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 data", &response))?;
        let fetched = offset + items.len() as i64;
        let next = match json_i64(json.get("count")) {
            Some(count) if !items.is_empty() && fetched < count => Some(fetched.to_string()),
            _ => None,
        };
        debug!("115 网页版列表: 目录={}, offset={}, {} 项", directory.id, offset, items.len());
        Ok(Page::new(items, next))
    }

    async fn list_all(&self, directory: &CloudItem, natsort: bool) -> CloudResult<Vec<CloudItem>> {
        collect_all(|offset| self.list_page(directory, offset, natsort)).await
    }
}

fn item_from_json(json: &Value) -> Option<CloudItem> {
    let cid = json_str(json, "cid")?;
    let name = json_str(json, "n")?;
    let fid = json_str(json, "fid");
    let is_directory = fid.is_none();
    let time = parse_timestamp(json.get("te"));
    let item = CloudItem::new(fid.unwrap_or(cid), name.clone(), name, is_directory)
        .with_size(json_i64(json.get("s")).unwrap_or(-1))
        .with_hash(json_str(json, "sha"))
        .with_times(time, time)
        .with_raw(json.clone());
    Some(item)
}

fn items_of_data(json: &Value) -> Option<Vec<CloudItem>> {
    let data = json.get("data")?.as_array()?;
    Some(data.iter().filter_map(item_from_json).collect())
}

/// `fid[0]`、`fid[1]`、…
fn fid_fields(items: &[CloudItem]) -> impl Iterator<Item = (String, String)> + '_ {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| (format!("fid[{}]", i), item.id.clone()))
}

/// 条目所在目录：文件夹的 `pid`，文件的 `cid`
fn parent_of(item: &CloudItem) -> Option<String> {
    let key = if item.is_directory { "pid" } else { "cid" };
    json_str(&item.raw_attributes, key)
}

#[async_trait]
impl CloudFileProvider for Drive115WebProvider {
    fn name(&self) -> &'static str {
        "115"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("0", "115", "/", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    async fn attributes_of_item(&self, _item: &CloudItem) -> CloudResult<CloudItem> {
        Err(CloudServiceError::Unsupported)
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let mut items = match self.list_all(directory, false).await {
            Err(CloudServiceError::Service { code, .. }) if code == NATSORT_REQUIRED => {
                info!("115 网页版要求自然排序，改用 aps 接口: 目录={}", directory.id);
                self.list_all(directory, true).await?
            }
            other => other?,
        };
        for item in &mut items {
            item.fix_path(directory);
        }
        Ok(items)
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let fields = vec![
            ("pid".to_string(), directory.id.clone()),
            ("cname".to_string(), name.to_string()),
        ];
        self.post_form("/files/add", fields).await
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let fields = vec![(format!("files_new_name[{}]", item.id), new_name.to_string())];
        self.post_form("/files/batch_rename", fields).await
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        self.move_items(std::slice::from_ref(item), directory).await
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        self.remove_items(std::slice::from_ref(item)).await
    }

    async fn download_request(&self, _item: &CloudItem) -> CloudResult<DownloadRequest> {
        Err(CloudServiceError::Unsupported)
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        Err(CloudServiceError::Unsupported)
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        Err(CloudServiceError::Unsupported)
    }

    async fn upload_local(
        &self,
        _file: LocalFile,
        _directory: &CloudItem,
        _options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        Err(CloudServiceError::Unsupported)
    }

    fn as_searching(&self) -> Option<&dyn CloudSearching> {
        Some(self)
    }

    fn as_batching(&self) -> Option<&dyn CloudBatching> {
        Some(self)
    }
}

#[async_trait]
impl CloudSearching for Drive115WebProvider {
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        let request = self
            .get(&self.web_api, "/files/search")
            .query("offset", 0)
            .query("limit", SEARCH_LIMIT)
            .query("search_value", keyword)
            .query("source", "")
            .query("format", "json");
        let (response, json) = self.pipeline.execute_json(request).await?;
        let mut items = items_of_data(&json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 data", &response))?;
        for item in &mut items {
            let path = join_path("/", &item.name);
            *item = item.clone().at_path(path);
        }
        Ok(items)
    }
}

#[async_trait]
impl CloudBatching for Drive115WebProvider {
    async fn remove_items(&self, items: &[CloudItem]) -> CloudResult<RawResponse> {
        let mut fields: Vec<(String, String)> = Vec::new();
        if let Some(pid) = items.first().and_then(parent_of) {
            fields.push(("pid".to_string(), pid));
        }
        fields.extend(fid_fields(items));
        fields.push(("ignore_warn".to_string(), "1".to_string()));
        self.post_form("/rb/delete", fields).await
    }

    async fn move_items(&self, items: &[CloudItem], directory: &CloudItem) -> CloudResult<RawResponse> {
        let mut fields = vec![("pid".to_string(), directory.id.clone())];
        fields.extend(fid_fields(items));
        fields.push(("move_proid".to_string(), Utc::now().timestamp().to_string()));
        self.post_form("/files/move", fields).await
    }
}
