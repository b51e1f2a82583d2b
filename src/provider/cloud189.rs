// 天翼云盘
//
// 所有接口 POST 到同一个地址，由 Method 请求头区分；每个请求带 MD5 签名

use crate::auth::Credential;
use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, RawResponse, RequestPipeline, SendProgress, SignFn};
use crate::provider::classifier::Cloud189Classifier;
use crate::provider::{
    ensure_success, join_path, json_i64, json_str, parse_china_datetime, parse_rfc3339,
    require_str, CloudCopying, CloudFileProvider, CloudItem, CloudSpaceInformation, CloudUser,
    DownloadRequest, ProviderContext, UploadOptions, UploadResult,
};
use crate::uploader::rapid_upload::md5_hex;
use crate::uploader::{
    ChunkedUploadEngine, ContinuationToken, Initiated, LocalFile, PartAck, RapidUploadChecker,
    TransferMode, UploadPart, UploadProtocol, UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// 分片大小 4MB
pub const CLOUD189_PART_SIZE: u64 = 4 * 1024 * 1024;

/// 空间类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cloud189CloudType {
    Family = 1,
    #[default]
    Personal = 2,
}

/// 签名：md5("AccessToken={token}&DateTime={date}&Method={method}")
pub fn cloud189_signature(access_token: &str, date: &str, method: &str) -> String {
    md5_hex(format!("AccessToken={}&DateTime={}&Method={}", access_token, date, method).as_bytes())
}

/// 东八区 `yyyy-MM-dd HH:mm:ss`
fn request_date() -> String {
    (Utc::now() + Duration::hours(8))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// 由请求上的 Method 头计算签名并写入 AccessToken / Date / Signature
fn signer() -> SignFn {
    Arc::new(|request: &mut HttpRequest, credential: &Credential| {
        let method = request.header_value("Method").unwrap_or_default().to_string();
        let date = request_date();
        let signature = cloud189_signature(&credential.token, &date, &method);
        request.set_header("AccessToken", credential.token.clone());
        request.set_header("Date", date);
        request.set_header("Signature", signature);
    })
}

pub struct Cloud189Provider {
    pipeline: Arc<RequestPipeline>,
    api: String,
    cloud_type: Cloud189CloudType,
}

impl Cloud189Provider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(Cloud189Classifier), AuthScheme::Custom(signer()));
        Self {
            pipeline: Arc::new(pipeline),
            api: context.endpoints.cloud189_api.trim_end_matches('/').to_string(),
            cloud_type: Cloud189CloudType::Personal,
        }
    }

    pub fn with_cloud_type(mut self, cloud_type: Cloud189CloudType) -> Self {
        self.cloud_type = cloud_type;
        self
    }

    async fn call(&self, method: &str, body: Value) -> CloudResult<(RawResponse, Value)> {
        call_method(&self.pipeline, &self.api, self.cloud_type, method, body).await
    }
}

/// 调用一个接口方法，请求体自动带上 cloudType
async fn call_method(
    pipeline: &RequestPipeline,
    url: &str,
    cloud_type: Cloud189CloudType,
    method: &str,
    mut body: Value,
) -> CloudResult<(RawResponse, Value)> {
    if let Some(map) = body.as_object_mut() {
        map.insert("cloudType".to_string(), json!(cloud_type as i32));
    }
    debug!("天翼云盘调用: {}", method);
    let request = HttpRequest::post(url).header("Method", method).json(body);
    pipeline.execute_json(request).await
}

fn item_from_json(json: &Value) -> Option<CloudItem> {
    let id = json_str(json, "id")?;
    let name = json_str(json, "name")?;
    let size = json_i64(json.get("size")).unwrap_or(-1);
    let is_directory = size == -1;
    let path = json_str(json, "path").unwrap_or_else(|| name.clone());
    let parse_time = |key: &str| parse_rfc3339(json.get(key)).or_else(|| parse_china_datetime(json.get(key)));
    let item = CloudItem::new(id, name, path, is_directory)
        .with_size(size)
        .with_hash(json_str(json, "md5"))
        .with_times(parse_time("createDate"), parse_time("lastOpTime"))
        .with_raw(json.clone());
    Some(item)
}

/// `listFiles.fileList[]` 中每个元素的 folder[] 与 file[]
fn items_of_list(json: &Value) -> Option<Vec<CloudItem>> {
    let groups = json.get("listFiles")?.get("fileList")?.as_array()?;
    let mut items = Vec::new();
    for group in groups {
        for key in ["folder", "file"] {
            if let Some(list) = group.get(key).and_then(Value::as_array) {
                items.extend(list.iter().filter_map(item_from_json));
            }
        }
    }
    Some(items)
}

/// 按类型选择 folder.* / file.* 方法名与 id 字段
fn kind_of(item: &CloudItem) -> (&'static str, &'static str) {
    if item.is_directory {
        ("folder", "folderId")
    } else {
        ("file", "fileId")
    }
}

#[async_trait]
impl CloudFileProvider for Cloud189Provider {
    fn name(&self) -> &'static str {
        "189"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("", "189", "", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem> {
        let (kind, id_key) = kind_of(item);
        let (response, json) = self
            .call(&format!("{}.info", kind), json!({ id_key: item.id }))
            .await?;
        item_from_json(&json)
            .map(|found| {
                if found.raw_str("path").is_some() {
                    found
                } else {
                    found.at_path(item.path())
                }
            })
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let (response, json) = self
            .call("file.list", json!({ "folderId": directory.id }))
            .await?;
        let mut items = items_of_list(&json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 listFiles", &response))?;
        for item in &mut items {
            if item.raw_str("path").is_none() {
                item.fix_path(directory);
            }
        }
        Ok(items)
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({
            "parentFolderId": directory.id,
            "relativePath": directory.path(),
            "folderName": name,
        });
        let (response, _) = self.call("folder.create", body).await?;
        Ok(response)
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let (kind, id_key) = kind_of(item);
        let name_key = if item.is_directory { "destFolderName" } else { "destFileName" };
        let (response, _) = self
            .call(
                &format!("{}.rename", kind),
                json!({ id_key: item.id, name_key: new_name }),
            )
            .await?;
        Ok(response)
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let (kind, id_key) = kind_of(item);
        let dest_key = if item.is_directory { "destParentFolderId" } else { "destParentId" };
        let (response, _) = self
            .call(
                &format!("{}.move", kind),
                json!({ id_key: item.id, dest_key: directory.id }),
            )
            .await?;
        Ok(response)
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        let (kind, id_key) = kind_of(item);
        let (response, _) = self
            .call(&format!("{}.delete", kind), json!({ id_key: item.id }))
            .await?;
        Ok(response)
    }

    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        if item.is_directory {
            return Err(CloudServiceError::Unsupported);
        }
        let (response, json) = self
            .call("file.download.url", json!({ "fileId": item.id }))
            .await?;
        Ok(DownloadRequest::new(require_str(&json, "fileDownloadUrl", &response)?))
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        let (response, json) = self.call("user.ext.info", json!({})).await?;
        let user_ext = json
            .get("userExt")
            .cloned()
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 userExt", &response))?;
        let username = require_str(&user_ext, "nickname", &response)?;
        Ok(CloudUser {
            username,
            raw_attributes: user_ext,
        })
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        let (response, json) = self.call("user.info", json!({})).await?;
        let user = json
            .get("user")
            .cloned()
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 user", &response))?;
        let capacity = json_i64(user.get("capacity"))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 capacity", &response))?;
        let available = json_i64(user.get("available")).unwrap_or(0);
        Ok(CloudSpaceInformation {
            total_space: capacity,
            available_space: available,
            raw_attributes: user,
        })
    }

    async fn upload_local(
        &self,
        file: LocalFile,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        let protocol = Cloud189Upload {
            pipeline: Arc::clone(&self.pipeline),
            api: self.api.clone(),
            cloud_type: self.cloud_type,
        };
        ChunkedUploadEngine::new(Arc::new(protocol), options)
            .upload(file, directory)
            .await
    }

    fn as_copying(&self) -> Option<&dyn CloudCopying> {
        Some(self)
    }
}

#[async_trait]
impl CloudCopying for Cloud189Provider {
    /// 只支持复制文件
    async fn copy_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        if item.is_directory {
            return Err(CloudServiceError::Unsupported);
        }
        let (response, _) = self
            .call(
                "file.copy",
                json!({ "fileId": item.id, "destParentId": directory.id }),
            )
            .await?;
        Ok(response)
    }
}

/// 天翼云盘续传协议
///
/// file.resume.create 创建会话（fileDataExists 表示秒传）-> 按 Offset PUT 数据 ->
/// file.resume.info 取服务端已收大小作为下一偏移 -> file.resume.commit
struct Cloud189Upload {
    pipeline: Arc<RequestPipeline>,
    api: String,
    cloud_type: Cloud189CloudType,
}

impl Cloud189Upload {
    async fn commit_upload(
        &self,
        upload_file_id: &str,
        file: &LocalFile,
        directory: &CloudItem,
        rapid_upload: bool,
    ) -> CloudResult<UploadResult> {
        let (response, json) = call_method(
            &self.pipeline,
            &self.api,
            self.cloud_type,
            "file.resume.commit",
            json!({ "uploadFileId": upload_file_id }),
        )
        .await?;
        let path = join_path(directory.path(), &file.name);
        let item = json
            .get("file")
            .and_then(item_from_json)
            .or_else(|| item_from_json(&json))
            .map(|item| item.at_path(path.clone()))
            .unwrap_or_else(|| {
                let id = json_str(&json, "fileId").unwrap_or_else(|| upload_file_id.to_string());
                CloudItem::new(id, file.name.clone(), path, false)
                    .with_size(file.size as i64)
                    .with_raw(json.clone())
            });
        Ok(UploadResult {
            item,
            response: Some(response),
            rapid_upload,
        })
    }
}

#[async_trait]
impl UploadProtocol for Cloud189Upload {
    fn name(&self) -> &'static str {
        "cloud189"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Sequential
    }

    async fn initiate(&self, file: &LocalFile, directory: &CloudItem) -> CloudResult<Initiated> {
        let hash = RapidUploadChecker::calculate_hash(&file.path).await?;
        let body = json!({
            "parentId": directory.id,
            "filename": file.name,
            "size": file.size,
            "md5": hash.content_md5,
        });
        let (response, json) = call_method(
            &self.pipeline,
            &self.api,
            self.cloud_type,
            "file.resume.create",
            body,
        )
        .await?;
        let upload_file = json
            .get("uploadFile")
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 uploadFile", &response))?;
        let upload_file_id = require_str(upload_file, "uploadFileId", &response)?;

        if json_i64(upload_file.get("fileDataExists")) == Some(1) {
            info!("天翼云盘秒传: {}", file.name);
            let result = self
                .commit_upload(&upload_file_id, file, directory, true)
                .await?;
            return Ok(Initiated::Completed(result));
        }

        let upload_url = require_str(upload_file, "fileUploadUrl", &response)?;
        let header = json.get("uploadHeader").cloned().unwrap_or(Value::Null);
        Ok(Initiated::Session(
            UploadSession::new(
                file.clone(),
                CLOUD189_PART_SIZE,
                directory.clone(),
                ContinuationToken::UploadId(upload_file_id),
            )
            .with_extra(json!({ "fileUploadUrl": upload_url, "uploadHeader": header })),
        ))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part: &UploadPart,
        data: Bytes,
        progress: SendProgress,
    ) -> CloudResult<PartAck> {
        let upload_url = json_str(&session.extra, "fileUploadUrl").unwrap_or_default();
        let header = &session.extra["uploadHeader"];
        let upload_file_id = session.continuation.as_str();

        // 数据上传使用会话下发的签名头，不走管线签名
        let request = HttpRequest::put(upload_url.clone())
            .unauthenticated()
            .header("ResumePolicy", "1")
            .header("Edrive-UploadFileId", upload_file_id)
            .header("Offset", part.offset().to_string())
            .header("AccessToken", json_str(header, "accessToken").unwrap_or_default())
            .header("Signature", json_str(header, "signature").unwrap_or_default())
            .header("Date", json_str(header, "date").unwrap_or_default())
            .bytes(data)
            .on_progress(progress);
        ensure_success(self.pipeline.execute(request).await?)?;

        let (_, status) = call_method(
            &self.pipeline,
            &upload_url,
            self.cloud_type,
            "file.resume.info",
            json!({ "uploadFileId": upload_file_id }),
        )
        .await?;
        let uploaded = status
            .get("uploadFile")
            .and_then(|upload_file| json_i64(upload_file.get("dataSize")))
            .map(|size| size.max(0) as u64);
        Ok(PartAck {
            next_offset: uploaded,
            ..PartAck::default()
        })
    }

    async fn commit(&self, session: &UploadSession) -> CloudResult<UploadResult> {
        self.commit_upload(
            session.continuation.as_str(),
            &session.local_file,
            &session.target_directory,
            false,
        )
        .await
    }
}
