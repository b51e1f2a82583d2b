// 云盘服务商模块
//
// CloudFileProvider 为所有服务商的统一能力接口；复制/搜索/批量为可选能力，
// 通过 as_copying / as_searching / as_batching 声明

pub mod classifier;
mod pagination;
mod types;

pub mod aliyun;
pub mod baidu;
pub mod box_drive;
pub mod cloud189;
pub mod drive115;
pub mod drive115_web;
pub mod drive123;
pub mod dropbox;
pub mod google_drive;
pub mod onedrive;
pub mod pcloud;
pub mod quark;

pub use classifier::{ResponseClassifier, ServiceFailure};
pub use pagination::{collect_all, paginate, Page};
pub(crate) use types::{json_i64, json_str, parse_china_datetime, parse_rfc3339, parse_timestamp};
pub use types::{
    join_path, CloudItem, CloudSpaceInformation, CloudUser, DownloadRequest, UploadOptions,
    UploadResult,
};

use crate::auth::{CookieRefreshedFn, Credential, RefreshHandler};
use crate::common::{ProgressTracker, RefreshCoordinatorConfig};
use crate::config::{AppConfig, ProviderEndpoints, UploadConfig};
use crate::error::{CloudResult, CloudServiceError};
use crate::http::{
    AuthScheme, BodyData, HttpRequest, HttpTransport, RawResponse, ReqwestTransport,
    RequestPipeline, SendProgress,
};
use crate::uploader::LocalFile;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 云盘统一能力接口
///
/// 所有修改类操作返回原始响应；错误在传输成功时同样携带原始响应
#[async_trait]
pub trait CloudFileProvider: Send + Sync {
    /// 服务商名称
    fn name(&self) -> &'static str;

    /// 根目录
    fn root_item(&self) -> CloudItem;

    /// 请求管线
    fn pipeline(&self) -> &RequestPipeline;

    /// 获取单个文件/文件夹的属性
    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem>;

    /// 列出目录下的全部内容（自动翻页）
    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>>;

    /// 在指定目录下创建文件夹
    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse>;

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse>;

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse>;

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse>;

    /// 下载直链与必须携带的请求头
    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest>;

    async fn current_user(&self) -> CloudResult<CloudUser>;

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation>;

    /// 上传已检查过的本地文件
    async fn upload_local(
        &self,
        file: LocalFile,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult>;

    /// 上传本地文件，远端文件名取路径最后一段
    ///
    /// 文件不存在时返回 `UploadFileNotExist`，不发出任何请求
    async fn upload_file(
        &self,
        path: &Path,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        let file = LocalFile::open(path).await?;
        self.upload_local(file, directory, options).await
    }

    /// 上传内存数据
    ///
    /// 数据先落到临时文件，再按本地文件上传；临时文件在返回前删除
    async fn upload_data(
        &self,
        data: Bytes,
        filename: &str,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        let staged = StagedFile::write(&data).await?;
        let file = LocalFile::open_named(staged.path(), filename).await?;
        self.upload_local(file, directory, options).await
    }

    /// 当前凭证快照
    fn credential(&self) -> Arc<Credential> {
        self.pipeline().credential()
    }

    /// 替换凭证
    fn set_credential(&self, credential: Credential) {
        self.pipeline().set_credential(credential);
    }

    fn as_copying(&self) -> Option<&dyn CloudCopying> {
        None
    }

    fn as_searching(&self) -> Option<&dyn CloudSearching> {
        None
    }

    fn as_batching(&self) -> Option<&dyn CloudBatching> {
        None
    }
}

/// 可选能力：复制
#[async_trait]
pub trait CloudCopying: Send + Sync {
    async fn copy_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse>;
}

/// 可选能力：按关键字搜索
#[async_trait]
pub trait CloudSearching: Send + Sync {
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>>;
}

/// 可选能力：批量删除/移动
#[async_trait]
pub trait CloudBatching: Send + Sync {
    async fn remove_items(&self, items: &[CloudItem]) -> CloudResult<RawResponse>;

    async fn move_items(&self, items: &[CloudItem], directory: &CloudItem)
        -> CloudResult<RawResponse>;
}

/// 复制（不支持时返回 `Unsupported`）
pub async fn copy_item(
    provider: &dyn CloudFileProvider,
    item: &CloudItem,
    directory: &CloudItem,
) -> CloudResult<RawResponse> {
    match provider.as_copying() {
        Some(copying) => copying.copy_item(item, directory).await,
        None => Err(unsupported(provider, "复制")),
    }
}

/// 搜索（不支持时返回 `Unsupported`）
pub async fn search_files(
    provider: &dyn CloudFileProvider,
    keyword: &str,
) -> CloudResult<Vec<CloudItem>> {
    match provider.as_searching() {
        Some(searching) => searching.search_files(keyword).await,
        None => Err(unsupported(provider, "搜索")),
    }
}

/// 批量删除（不支持时返回 `Unsupported`）
pub async fn remove_items(
    provider: &dyn CloudFileProvider,
    items: &[CloudItem],
) -> CloudResult<RawResponse> {
    match provider.as_batching() {
        Some(batching) => batching.remove_items(items).await,
        None => Err(unsupported(provider, "批量删除")),
    }
}

/// 批量移动（不支持时返回 `Unsupported`）
pub async fn move_items(
    provider: &dyn CloudFileProvider,
    items: &[CloudItem],
    directory: &CloudItem,
) -> CloudResult<RawResponse> {
    match provider.as_batching() {
        Some(batching) => batching.move_items(items, directory).await,
        None => Err(unsupported(provider, "批量移动")),
    }
}

fn unsupported(provider: &dyn CloudFileProvider, operation: &str) -> CloudServiceError {
    debug!("{} 不支持{}", provider.name(), operation);
    CloudServiceError::Unsupported
}

/// 服务商类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    AliyunDrive,
    BaiduPan,
    Box,
    Dropbox,
    GoogleDrive,
    OneDrive,
    PCloud,
    Cloud189,
    Drive123,
    Drive115,
    /// 115 网页版（Cookie 登录）
    Drive115Web,
    /// 夸克网盘（Cookie 登录）
    Quark,
}

impl ProviderKind {
    pub fn all() -> &'static [ProviderKind] {
        &[
            ProviderKind::AliyunDrive,
            ProviderKind::BaiduPan,
            ProviderKind::Box,
            ProviderKind::Dropbox,
            ProviderKind::GoogleDrive,
            ProviderKind::OneDrive,
            ProviderKind::PCloud,
            ProviderKind::Cloud189,
            ProviderKind::Drive123,
            ProviderKind::Drive115,
            ProviderKind::Drive115Web,
            ProviderKind::Quark,
        ]
    }

    /// 构造服务商实例
    pub fn build(self, context: ProviderContext) -> Arc<dyn CloudFileProvider> {
        match self {
            ProviderKind::AliyunDrive => Arc::new(aliyun::AliyunDriveProvider::new(context)),
            ProviderKind::BaiduPan => Arc::new(baidu::BaiduPanProvider::new(context)),
            ProviderKind::Box => Arc::new(box_drive::BoxProvider::new(context)),
            ProviderKind::Dropbox => Arc::new(dropbox::DropboxProvider::new(context)),
            ProviderKind::GoogleDrive => Arc::new(google_drive::GoogleDriveProvider::new(context)),
            ProviderKind::OneDrive => Arc::new(onedrive::OneDriveProvider::new(context)),
            ProviderKind::PCloud => Arc::new(pcloud::PCloudProvider::new(context)),
            ProviderKind::Cloud189 => Arc::new(cloud189::Cloud189Provider::new(context)),
            ProviderKind::Drive123 => Arc::new(drive123::Drive123Provider::new(context)),
            ProviderKind::Drive115 => Arc::new(drive115::Drive115Provider::new(context)),
            ProviderKind::Drive115Web => Arc::new(drive115_web::Drive115WebProvider::new(context)),
            ProviderKind::Quark => Arc::new(quark::QuarkProvider::new(context)),
        }
    }
}

/// 构造服务商所需的依赖
#[derive(Clone)]
pub struct ProviderContext {
    pub credential: Credential,
    pub refresh: Option<Arc<dyn RefreshHandler>>,
    pub transport: Arc<dyn HttpTransport>,
    pub endpoints: ProviderEndpoints,
    pub upload: UploadConfig,
    pub refresh_config: RefreshCoordinatorConfig,
    /// Cookie 登录的服务商轮换 Cookie 后回调
    pub cookie_refreshed: Option<CookieRefreshedFn>,
}

impl ProviderContext {
    pub fn new(credential: Credential, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            credential,
            refresh: None,
            transport,
            endpoints: ProviderEndpoints::default(),
            upload: UploadConfig::default(),
            refresh_config: RefreshCoordinatorConfig::default(),
            cookie_refreshed: None,
        }
    }

    /// 按应用配置构造（使用 reqwest 传输层）
    pub fn from_config(config: &AppConfig, credential: Credential) -> CloudResult<Self> {
        let transport = ReqwestTransport::new(&config.http)?;
        Ok(Self {
            endpoints: config.providers.clone(),
            upload: config.upload.clone(),
            ..Self::new(credential, Arc::new(transport))
        })
    }

    pub fn with_refresh_handler(mut self, handler: Arc<dyn RefreshHandler>) -> Self {
        self.refresh = Some(handler);
        self
    }

    pub fn with_endpoints(mut self, endpoints: ProviderEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_upload_config(mut self, upload: UploadConfig) -> Self {
        self.upload = upload;
        self
    }

    pub fn with_refresh_config(mut self, config: RefreshCoordinatorConfig) -> Self {
        self.refresh_config = config;
        self
    }

    pub fn with_cookie_refreshed_handler(mut self, handler: CookieRefreshedFn) -> Self {
        self.cookie_refreshed = Some(handler);
        self
    }

    /// 以本上下文的凭证与刷新回调构造请求管线
    pub(crate) fn pipeline(
        &self,
        classifier: Arc<dyn ResponseClassifier>,
        auth: AuthScheme,
    ) -> RequestPipeline {
        RequestPipeline::new(
            Arc::clone(&self.transport),
            self.credential.clone(),
            classifier,
        )
        .with_auth(auth)
        .with_refresh_handler(self.refresh.clone())
        .with_refresh_config(self.refresh_config.clone())
        .with_cookie_refreshed_handler(self.cookie_refreshed.clone())
    }
}

/// 预签名地址等不经分类器的请求：非 2xx 视为业务错误
pub(crate) fn ensure_success(response: RawResponse) -> CloudResult<RawResponse> {
    if response.is_success() {
        return Ok(response);
    }
    let status = response.status() as i64;
    let text = response.text().trim().to_string();
    Err(CloudServiceError::Service {
        code: status,
        message: if text.is_empty() { None } else { Some(text) },
        response: Some(Box::new(response)),
    })
}

/// 取 JSON 字段，缺失时返回带原始响应的解析错误
pub(crate) fn require_str(
    json: &serde_json::Value,
    key: &str,
    response: &RawResponse,
) -> CloudResult<String> {
    json_str(json, key)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| CloudServiceError::decode(format!("响应中缺少字段 {}", key), response))
}

/// 单请求上传：整个文件作为一个请求发送
///
/// `build` 接收文件内容并构造请求；内容以文件流发送，不整体读入内存。
/// 发送前后检查取消，成功后进度报告为 100%
pub(crate) async fn upload_in_one_request<F>(
    pipeline: &RequestPipeline,
    file: &LocalFile,
    options: &UploadOptions,
    build: F,
) -> CloudResult<RawResponse>
where
    F: FnOnce(BodyData) -> HttpRequest + Send,
{
    let cancel = options.cancel_token();
    if cancel.is_cancelled() {
        return Err(CloudServiceError::Cancelled);
    }

    let data = BodyData::file(file.path.clone(), file.size);
    let tracker = Arc::new(ProgressTracker::new(file.size, options.progress.clone()));
    let progress_tracker = Arc::clone(&tracker);
    let progress: SendProgress = Arc::new(move |sent| progress_tracker.advance_to(sent));

    debug!("单请求上传: 文件={}, 大小={} bytes", file.name, file.size);
    let response = pipeline.execute(build(data).on_progress(progress)).await?;
    if cancel.is_cancelled() {
        info!("上传已取消，忽略响应: {}", file.name);
        return Err(CloudServiceError::Cancelled);
    }
    tracker.finish();
    Ok(response)
}

/// upload_data 使用的临时文件，离开作用域时删除
struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    async fn write(data: &[u8]) -> CloudResult<Self> {
        let path = std::env::temp_dir().join(format!("cloud-upload-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, data).await?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("删除临时上传文件失败: {:?}, 错误: {}", self.path, e);
        }
    }
}
