// 115 网盘开放平台
//
// 写操作都是表单 POST；上传先 init 做秒传检查，未命中时拿 STS 临时凭证直传对象存储

use crate::common::ProgressTracker;
use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, HttpTransport, RawResponse, RequestPipeline};
use crate::provider::classifier::Drive115Classifier;
use crate::provider::{
    collect_all, join_path, json_i64, json_str, parse_timestamp, require_str, CloudFileProvider,
    CloudItem, CloudSearching, CloudSpaceInformation, CloudUser, DownloadRequest, Page,
    ProviderContext, ResponseClassifier, UploadOptions, UploadResult,
};
use crate::uploader::{
    LocalFile, ObjectStorageMultipartClient, OssCallback, OssCredential, OssTarget,
    RapidUploadChecker,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PAGE_LIMIT: u64 = 100;

/// 下载链接与请求下载链接时的 User-Agent 必须一致
pub const DRIVE115_USER_AGENT: &str = "cloud-service-rust";

/// init 返回的状态
const STATUS_NEED_UPLOAD: i64 = 1;
const STATUS_RAPID_UPLOAD: i64 = 2;
const STATUS_NEED_SIGN: i64 = 7;

/// 二次校验最多重发 init 的次数
const MAX_SIGN_ROUNDS: usize = 2;

fn data_of(json: &Value) -> &Value {
    json.get("data").unwrap_or(json)
}

pub struct Drive115Provider {
    pipeline: Arc<RequestPipeline>,
    transport: Arc<dyn HttpTransport>,
    api: String,
    oss_part_size: u64,
    max_parallel: usize,
}

impl Drive115Provider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(Drive115Classifier), AuthScheme::Bearer);
        Self {
            pipeline: Arc::new(pipeline),
            transport: Arc::clone(&context.transport),
            api: context.endpoints.drive115_api.trim_end_matches('/').to_string(),
            oss_part_size: context.upload.oss_part_size(),
            max_parallel: context.upload.max_concurrent_parts.max(1),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api, path)
    }

    async fn post_form(&self, path: &str, fields: Vec<(&str, String)>) -> CloudResult<(RawResponse, Value)> {
        let request = HttpRequest::post(self.url(path)).form(fields);
        self.pipeline.execute_json(request).await
    }

    /// `offset` 分页，`count` 为总数
    async fn offset_page(
        &self,
        request: HttpRequest,
        offset: Option<String>,
    ) -> CloudResult<Page<CloudItem>> {
        let offset: u64 = offset.and_then(|o| o.parse().ok()).unwrap_or(0);
        let request = request.query("limit", PAGE_LIMIT).query("offset", offset);
        let (response, json) = self.pipeline.execute_json(request).await?;
        let list = json
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件列表", &response))?;
        let items: Vec<CloudItem> = list.iter().filter_map(item_from_json).collect();
        let total = json_i64(json.get("count")).unwrap_or(0).max(0) as u64;
        let next = offset + list.len() as u64;
        let token = if list.is_empty() || next >= total {
            None
        } else {
            Some(next.to_string())
        };
        Ok(Page::new(items, token))
    }

    /// upload/init，必要时按 sign_check 区间补算 SHA1 重发
    async fn init_upload(
        &self,
        file: &LocalFile,
        directory: &CloudItem,
        content_sha1: &str,
        head_sha1: &str,
    ) -> CloudResult<(RawResponse, Value)> {
        let base = vec![
            ("file_name", file.name.clone()),
            ("file_size", file.size.to_string()),
            ("target", format!("U_1_{}", directory.id)),
            ("fileid", content_sha1.to_string()),
            ("preid", head_sha1.to_string()),
        ];
        let mut fields = base.clone();
        for round in 0..=MAX_SIGN_ROUNDS {
            let (response, json) = self.post_form("/open/upload/init", fields).await?;
            let data = data_of(&json);
            if json_i64(data.get("status")) != Some(STATUS_NEED_SIGN) || round == MAX_SIGN_ROUNDS {
                return Ok((response, json));
            }

            let sign_key = require_str(data, "sign_key", &response)?;
            let sign_check = require_str(data, "sign_check", &response)?;
            let (start, end) = parse_sign_range(&sign_check)
                .ok_or_else(|| CloudServiceError::decode("sign_check 格式错误", &response))?;
            debug!("115 二次校验: 区间 {}-{}", start, end);
            let sign_val = RapidUploadChecker::calculate_range_sha1(&file.path, start, end).await?;
            fields = base.clone();
            fields.push(("sign_key", sign_key));
            fields.push(("sign_val", sign_val));
        }
        Err(CloudServiceError::ResponseDecode {
            reason: "二次校验未通过".to_string(),
            response: None,
        })
    }

    async fn sts_credential(&self) -> CloudResult<(String, OssCredential)> {
        let (response, json) = self
            .pipeline
            .execute_json(HttpRequest::get(self.url("/open/upload/get_token")))
            .await?;
        let data = data_of(&json);
        let data = data.get(0).unwrap_or(data);
        let endpoint = require_str(data, "endpoint", &response)?;
        let credential = OssCredential {
            access_key_id: require_str(data, "AccessKeyId", &response)?,
            access_key_secret: require_str(data, "AccessKeySecret", &response)?,
            security_token: json_str(data, "SecurityToken"),
        };
        Ok((endpoint, credential))
    }
}

/// "start-end"
fn parse_sign_range(check: &str) -> Option<(u64, u64)> {
    let (start, end) = check.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// 列表与搜索返回的字段名不同（fid/fn/fc/fs 与 file_id/file_name/file_category/file_size）
fn item_from_json(json: &Value) -> Option<CloudItem> {
    let id = json_str(json, "fid").or_else(|| json_str(json, "file_id"))?;
    let name = json_str(json, "fn").or_else(|| json_str(json, "file_name"))?;
    let category = json_str(json, "fc").or_else(|| json_str(json, "file_category"));
    let is_directory = category.as_deref() == Some("0");
    let size = json_i64(json.get("fs"))
        .or_else(|| json_i64(json.get("file_size")))
        .unwrap_or(-1);
    let modified = parse_timestamp(json.get("upt")).or_else(|| parse_timestamp(json.get("user_utime")));
    let created = parse_timestamp(json.get("uppt")).or(modified);
    let item = CloudItem::new(id, name.clone(), name, is_directory)
        .with_size(if is_directory { -1 } else { size })
        .with_hash(json_str(json, "sha1"))
        .with_times(created, modified)
        .with_raw(json.clone());
    Some(item)
}

fn pick_code_of(item: &CloudItem) -> Option<String> {
    json_str(&item.raw_attributes, "pc").or_else(|| json_str(&item.raw_attributes, "pick_code"))
}

fn uploaded_item(
    data: &Value,
    file: &LocalFile,
    directory: &CloudItem,
    fallback_id: &str,
) -> CloudItem {
    let id = json_str(data, "file_id").unwrap_or_else(|| fallback_id.to_string());
    CloudItem::new(id, file.name.clone(), join_path(directory.path(), &file.name), false)
        .with_size(file.size as i64)
        .with_hash(json_str(data, "sha1"))
        .with_raw(data.clone())
}

/// init 下发的回调，`callback` 可能是对象或数组
fn callback_of(data: &Value) -> Option<OssCallback> {
    let callback = data.get("callback")?;
    let callback = callback.get(0).unwrap_or(callback);
    Some(OssCallback {
        callback: json_str(callback, "callback")?,
        callback_var: json_str(callback, "callback_var"),
    })
}

#[async_trait]
impl CloudFileProvider for Drive115Provider {
    fn name(&self) -> &'static str {
        "115"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("0", "115", "/", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem> {
        let request = HttpRequest::get(self.url("/open/folder/get_info")).query("file_id", &item.id);
        let (response, json) = self.pipeline.execute_json(request).await?;
        item_from_json(data_of(&json))
            .map(|found| found.at_path(item.path()))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let url = self.url("/open/ufile/files");
        let fetch = |offset: Option<String>| {
            let request = HttpRequest::get(url.clone())
                .query("cid", &directory.id)
                .query("asc", 1)
                .query("show_dir", 1);
            self.offset_page(request, offset)
        };
        let mut items = collect_all(fetch).await?;
        for item in &mut items {
            item.fix_path(directory);
        }
        Ok(items)
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let fields = vec![("pid", directory.id.clone()), ("file_name", name.to_string())];
        let (response, _) = self.post_form("/open/folder/add", fields).await?;
        Ok(response)
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let fields = vec![("file_id", item.id.clone()), ("file_name", new_name.to_string())];
        let (response, _) = self.post_form("/open/ufile/update", fields).await?;
        Ok(response)
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let fields = vec![("file_ids", item.id.clone()), ("to_cid", directory.id.clone())];
        let (response, _) = self.post_form("/open/ufile/move", fields).await?;
        Ok(response)
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        let fields = vec![("file_ids", item.id.clone())];
        let (response, _) = self.post_form("/open/ufile/delete", fields).await?;
        Ok(response)
    }

    /// 下载链接按 pick_code 获取，结果以文件 ID 为键
    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        let pick_code = pick_code_of(item).ok_or_else(|| CloudServiceError::ResponseDecode {
            reason: format!("条目缺少 pick_code: {}", item.id),
            response: None,
        })?;
        let request = HttpRequest::post(self.url("/open/ufile/downurl"))
            .header("User-Agent", DRIVE115_USER_AGENT)
            .form(vec![("pick_code", pick_code)]);
        let (response, json) = self.pipeline.execute_json(request).await?;
        let url = json
            .get("data")
            .and_then(|data| data.get(item.id.as_str()))
            .and_then(|entry| entry.get("url"))
            .and_then(|url| json_str(url, "url"))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少下载链接", &response))?;
        Ok(DownloadRequest::new(url).header("User-Agent", DRIVE115_USER_AGENT))
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        let (response, json) = self.post_form("/open/user/info", Vec::new()).await?;
        let data = data_of(&json).clone();
        let username = json_str(&data, "user_name")
            .or_else(|| json_str(&data, "nick_name"))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少用户名", &response))?;
        Ok(CloudUser {
            username,
            raw_attributes: data,
        })
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        let (response, json) = self.post_form("/open/user/info", Vec::new()).await?;
        let data = data_of(&json).clone();
        let info = data.get("rt_space_info");
        let size_of = |key: &str| {
            info.and_then(|info| info.get(key))
                .and_then(|entry| json_i64(entry.get("size")))
        };
        let total = size_of("all_total")
            .ok_or_else(|| CloudServiceError::decode("响应中缺少空间信息", &response))?;
        let used = size_of("all_use").unwrap_or(0);
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
        if options.cancel_token().is_cancelled() {
            return Err(CloudServiceError::Cancelled);
        }
        let hash = RapidUploadChecker::calculate_hash(&file.path).await?;
        let (response, json) = self
            .init_upload(&file, directory, &hash.content_sha1, &hash.head_sha1)
            .await?;
        let data = data_of(&json);

        match json_i64(data.get("status")) {
            Some(STATUS_RAPID_UPLOAD) => {
                info!("115 秒传成功: {}", file.name);
                ProgressTracker::new(file.size, options.progress.clone()).finish();
                let item = uploaded_item(data, &file, directory, "");
                return Ok(UploadResult {
                    item,
                    response: Some(response),
                    rapid_upload: true,
                });
            }
            Some(STATUS_NEED_UPLOAD) => {}
            other => {
                warn!("115 上传初始化返回未知状态: {:?}", other);
                return Err(CloudServiceError::decode("无法识别的上传状态", &response));
            }
        }

        let bucket = require_str(data, "bucket", &response)?;
        let object = require_str(data, "object", &response)?;
        let callback = callback_of(data);
        let (endpoint, credential) = self.sts_credential().await?;
        debug!("115 对象存储上传: bucket={}, object={}", bucket, object);

        let client = ObjectStorageMultipartClient::new(
            Arc::clone(&self.transport),
            credential,
            OssTarget {
                endpoint,
                bucket,
                object: object.clone(),
                callback,
            },
        )
        .with_part_size(self.oss_part_size)
        .with_max_parallel(self.max_parallel);
        let result = Arc::new(client).upload(file.clone(), directory, options).await?;

        // 回调结果由 115 返回，沿用业务错误判定
        if let Some(response) = &result.response {
            if let Some(failure) = Drive115Classifier.classify(response) {
                return Err(CloudServiceError::Service {
                    code: failure.code,
                    message: failure.message,
                    response: Some(Box::new(response.clone())),
                });
            }
        }
        let callback_data = result
            .response
            .as_ref()
            .and_then(RawResponse::json)
            .map(|json| data_of(&json).clone())
            .unwrap_or(Value::Null);
        Ok(UploadResult {
            item: uploaded_item(&callback_data, &file, directory, &object),
            response: result.response,
            rapid_upload: false,
        })
    }

    fn as_searching(&self) -> Option<&dyn CloudSearching> {
        Some(self)
    }
}

#[async_trait]
impl CloudSearching for Drive115Provider {
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        let url = self.url("/open/ufile/search");
        let fetch = |offset: Option<String>| {
            let request = HttpRequest::get(url.clone()).query("search_value", keyword);
            self.offset_page(request, offset)
        };
        collect_all(fetch).await
    }
}
