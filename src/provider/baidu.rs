// 百度网盘开放平台
//
// 文件管理走 xpan/file?method=...，凭证放在 access_token 查询参数中；
// 上传为 precreate -> superfile2 分片 -> create

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, MultipartBody, RawResponse, RequestPipeline, SendProgress};
use crate::provider::classifier::BaiduClassifier;
use crate::provider::{
    collect_all, json_i64, json_str, parse_timestamp, CloudBatching, CloudCopying,
    CloudFileProvider, CloudItem, CloudSearching, CloudSpaceInformation, CloudUser,
    DownloadRequest, Page, ProviderContext, UploadOptions, UploadResult,
};
use crate::uploader::{
    ChunkedUploadEngine, ContinuationToken, Initiated, LocalFile, PartAck, RapidUploadChecker,
    TransferMode, UploadPart, UploadProtocol, UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

/// 分片大小 4MB（与块列表 MD5 的分块一致）
pub const BAIDU_PART_SIZE: u64 = 4 * 1024 * 1024;

/// 单页条数
const PAGE_LIMIT: u64 = 1000;

/// 下载直链要求的 User-Agent
const DOWNLOAD_USER_AGENT: &str = "pan.baidu.com";

/// 预创建响应
#[derive(Debug, Deserialize)]
struct PrecreateResponse {
    #[serde(default)]
    uploadid: String,
    /// 2 表示秒传命中
    #[serde(default)]
    return_type: i32,
    #[serde(default)]
    info: Option<Value>,
}

/// superfile2 分片响应
#[derive(Debug, Default, Deserialize)]
struct UploadChunkResponse {
    #[serde(default)]
    md5: String,
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

/// 百度网盘
pub struct BaiduPanProvider {
    pipeline: Arc<RequestPipeline>,
    api: String,
    upload_api: String,
    /// 开放平台应用名；设置后先上传到 /apps/{app_name} 再移动到目标目录
    app_name: Option<String>,
}

impl BaiduPanProvider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(BaiduClassifier), AuthScheme::Query("access_token"));
        Self {
            pipeline: Arc::new(pipeline),
            api: context.endpoints.baidu_api.trim_end_matches('/').to_string(),
            upload_api: context.endpoints.baidu_upload.trim_end_matches('/').to_string(),
            app_name: None,
        }
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        self.app_name = if app_name.is_empty() { None } else { Some(app_name) };
        self
    }

    fn file_url(&self) -> String {
        format!("{}/xpan/file", self.api)
    }

    /// 配额接口不在 rest/2.0 下
    fn quota_url(&self) -> String {
        format!("{}/api/quota", self.api.trim_end_matches("/rest/2.0"))
    }

    async fn file_manager(&self, opera: &str, filelist: Value) -> CloudResult<RawResponse> {
        let request = HttpRequest::post(self.file_url())
            .query("method", "filemanager")
            .query("opera", opera)
            .form([
                ("async", "1".to_string()),
                ("ondup", "fail".to_string()),
                ("filelist", filelist.to_string()),
            ]);
        self.pipeline.execute(request).await
    }

    async fn list_page(&self, dir: &str, start: Option<String>) -> CloudResult<Page<CloudItem>> {
        let start: u64 = start.and_then(|s| s.parse().ok()).unwrap_or(0);
        let request = HttpRequest::get(self.file_url())
            .query("method", "list")
            .query("dir", dir)
            .query("web", "web")
            .query("start", start)
            .query("limit", PAGE_LIMIT);
        let (_, json) = self.pipeline.execute_json(request).await?;
        let items = items_of(&json);
        let next = if items.len() as u64 >= PAGE_LIMIT {
            Some((start + PAGE_LIMIT).to_string())
        } else {
            None
        };
        Ok(Page::new(items, next))
    }
}

/// JSON 转 CloudItem（百度返回完整路径）
fn item_from_json(json: &Value) -> Option<CloudItem> {
    let name = json_str(json, "server_filename").or_else(|| json_str(json, "filename"))?;
    let path = json_str(json, "path")?;
    let fs_id = json_str(json, "fs_id")?;
    let is_directory = json_i64(json.get("isdir")) == Some(1);
    let item = CloudItem::new(fs_id, name, path.clone(), is_directory)
        .at_path(path)
        .with_size(json_i64(json.get("size")).unwrap_or(-1))
        .with_hash(json_str(json, "md5"))
        .with_times(
            parse_timestamp(json.get("server_ctime")),
            parse_timestamp(json.get("server_mtime")),
        )
        .with_raw(json.clone());
    Some(item)
}

fn items_of(json: &Value) -> Vec<CloudItem> {
    json.get("list")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(item_from_json).collect())
        .unwrap_or_default()
}

fn move_entry(item: &CloudItem, directory: &CloudItem) -> Value {
    json!({
        "path": item.path(),
        "dest": directory.path(),
        "newname": item.name,
        "ondup": "fail",
    })
}

#[async_trait]
impl CloudFileProvider for BaiduPanProvider {
    fn name(&self) -> &'static str {
        "BaiduPan"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("0", "BaiduPan", "/", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// 只支持文件（filemetas 不返回目录信息）
    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem> {
        if item.is_directory {
            return Err(CloudServiceError::Unsupported);
        }
        let fs_id: i64 = item.id.parse().unwrap_or(-1);
        let request = HttpRequest::get(format!("{}/xpan/multimedia", self.api))
            .query("method", "filemetas")
            .query("fsids", json!([fs_id]).to_string())
            .query("thumb", 1)
            .query("dlink", 1)
            .query("extra", 1);
        let (response, json) = self.pipeline.execute_json(request).await?;
        json.get("list")
            .and_then(|list| list.get(0))
            .and_then(item_from_json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少文件信息", &response))
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let dir = directory.path();
        collect_all(move |start| self.list_page(dir, start)).await
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let path = crate::provider::join_path(directory.path(), name);
        let request = HttpRequest::post(self.file_url())
            .query("method", "create")
            .form([("path", path), ("size", "0".to_string()), ("isdir", "1".to_string())]);
        self.pipeline.execute(request).await
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let filelist = json!([{ "path": item.path(), "newname": new_name }]);
        self.file_manager("rename", filelist).await
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        self.file_manager("move", json!([move_entry(item, directory)])).await
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        self.file_manager("delete", json!([item.path()])).await
    }

    /// dlink 需追加 access_token，且必须带 `User-Agent: pan.baidu.com`
    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        let detail = self.attributes_of_item(item).await?;
        let dlink = detail.raw_str("dlink").ok_or_else(|| CloudServiceError::ResponseDecode {
            reason: "文件信息中缺少 dlink".to_string(),
            response: None,
        })?;
        let token = self.pipeline.credential().token.clone();
        let separator = if dlink.contains('?') { '&' } else { '?' };
        let url = format!("{}{}access_token={}", dlink, separator, urlencoding::encode(&token));
        Ok(DownloadRequest::new(url).header("User-Agent", DOWNLOAD_USER_AGENT))
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        let request = HttpRequest::get(format!("{}/xpan/nas", self.api)).query("method", "uinfo");
        let (response, json) = self.pipeline.execute_json(request).await?;
        let username = json_str(&json, "baidu_name")
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 baidu_name", &response))?;
        Ok(CloudUser {
            username,
            raw_attributes: json,
        })
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        let request = HttpRequest::get(self.quota_url())
            .query("checkfree", 1)
            .query("checkexpire", 0);
        let (response, json) = self.pipeline.execute_json(request).await?;
        match (json_i64(json.get("total")), json_i64(json.get("free"))) {
            (Some(total), Some(free)) => Ok(CloudSpaceInformation {
                total_space: total,
                available_space: free,
                raw_attributes: json,
            }),
            _ => Err(CloudServiceError::decode("响应中缺少 total/free", &response)),
        }
    }

    async fn upload_local(
        &self,
        file: LocalFile,
        directory: &CloudItem,
        options: UploadOptions,
    ) -> CloudResult<UploadResult> {
        let protocol = Arc::new(BaiduUpload {
            pipeline: Arc::clone(&self.pipeline),
            file_url: self.file_url(),
            upload_url: format!("{}/pcs/superfile2", self.upload_api),
            app_name: self.app_name.clone(),
        });
        let mut result = ChunkedUploadEngine::new(protocol, options)
            .upload(file, directory)
            .await?;

        // 第三方应用只能写入 /apps/{app_name}，完成后再移到目标目录
        if let Some(app_name) = &self.app_name {
            let staged_dir = format!("/apps/{}", app_name);
            if directory.path().trim_end_matches('/') != staged_dir {
                info!("上传完成，移动到目标目录: {} -> {}", result.item.path(), directory.path());
                let response = self.move_item(&result.item, directory).await?;
                let path = crate::provider::join_path(directory.path(), &result.item.name);
                result.item = result.item.at_path(path);
                result.response = Some(response);
            }
        }
        Ok(result)
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
impl CloudCopying for BaiduPanProvider {
    async fn copy_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        self.file_manager("copy", json!([move_entry(item, directory)])).await
    }
}

#[async_trait]
impl CloudSearching for BaiduPanProvider {
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        let request = HttpRequest::get(self.file_url())
            .query("method", "search")
            .query("key", keyword)
            .query("recursion", 1);
        let (_, json) = self.pipeline.execute_json(request).await?;
        Ok(items_of(&json))
    }
}

#[async_trait]
impl CloudBatching for BaiduPanProvider {
    async fn remove_items(&self, items: &[CloudItem]) -> CloudResult<RawResponse> {
        let paths: Vec<&str> = items.iter().map(|item| item.path()).collect();
        self.file_manager("delete", json!(paths)).await
    }

    async fn move_items(&self, items: &[CloudItem], directory: &CloudItem) -> CloudResult<RawResponse> {
        let entries: Vec<Value> = items.iter().map(|item| move_entry(item, directory)).collect();
        self.file_manager("move", Value::Array(entries)).await
    }
}

/// 百度网盘上传协议
struct BaiduUpload {
    pipeline: Arc<RequestPipeline>,
    file_url: String,
    upload_url: String,
    app_name: Option<String>,
}

impl BaiduUpload {
    fn remote_path(&self, file: &LocalFile, directory: &CloudItem) -> String {
        match &self.app_name {
            Some(app_name) => format!("/apps/{}/{}", app_name, file.name),
            None => crate::provider::join_path(directory.path(), &file.name),
        }
    }
}

fn remote_path_of(session: &UploadSession) -> CloudResult<String> {
    json_str(&session.extra, "path").ok_or_else(|| CloudServiceError::ResponseDecode {
        reason: "上传会话缺少远端路径".to_string(),
        response: None,
    })
}

#[async_trait]
impl UploadProtocol for BaiduUpload {
    fn name(&self) -> &'static str {
        "baidu"
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode::Sequential
    }

    async fn initiate(&self, file: &LocalFile, directory: &CloudItem) -> CloudResult<Initiated> {
        let block_list = RapidUploadChecker::calculate_block_list(&file.path, BAIDU_PART_SIZE).await?;
        let block_list = json!(block_list).to_string();
        let path = self.remote_path(file, directory);
        info!("预创建文件: path={}, size={}", path, file.size);

        let request = HttpRequest::post(self.file_url.clone())
            .query("method", "precreate")
            .form([
                ("path", path.clone()),
                ("size", file.size.to_string()),
                ("isdir", "0".to_string()),
                ("autoinit", "1".to_string()),
                // 1 = path 冲突时重命名
                ("rtype", "1".to_string()),
                ("block_list", block_list.clone()),
            ]);
        let (response, json) = self.pipeline.execute_json(request).await?;
        let precreate: PrecreateResponse = serde_json::from_value(json.clone())
            .map_err(|e| CloudServiceError::decode(format!("解析预创建响应失败: {}", e), &response))?;

        if precreate.return_type == 2 {
            info!("秒传成功: path={}", path);
            let info = precreate.info.unwrap_or_else(|| json.clone());
            let id = json_str(&info, "fs_id").unwrap_or_default();
            let remote_path = json_str(&info, "path").unwrap_or_else(|| path.clone());
            let item = CloudItem::new(id, file.name.clone(), remote_path.clone(), false)
                .at_path(remote_path)
                .with_size(file.size as i64)
                .with_raw(info);
            return Ok(Initiated::Completed(UploadResult {
                item,
                response: Some(response),
                rapid_upload: true,
            }));
        }

        if precreate.uploadid.is_empty() {
            return Err(CloudServiceError::decode("预创建响应缺少 uploadid", &response));
        }
        info!(
            "预创建成功: uploadid={}, return_type={}",
            precreate.uploadid, precreate.return_type
        );
        Ok(Initiated::Session(
            UploadSession::new(
                file.clone(),
                BAIDU_PART_SIZE,
                directory.clone(),
                ContinuationToken::UploadId(precreate.uploadid),
            )
            .with_extra(json!({ "path": path, "block_list": block_list })),
        ))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part: &UploadPart,
        data: Bytes,
        progress: SendProgress,
    ) -> CloudResult<PartAck> {
        let path = remote_path_of(session)?;
        // partseq 从 0 开始
        let part_seq = part.part_number - 1;
        debug!("上传分片: path={}, part={}, size={}", path, part_seq, data.len());

        let request = HttpRequest::post(self.upload_url.clone())
            .query("method", "upload")
            .query("type", "tmpfile")
            .query("path", &path)
            .query("uploadid", session.continuation.as_str())
            .query("partseq", part_seq)
            .multipart(MultipartBody::new().file("file", "file", data))
            .on_progress(progress);
        let (response, json) = self.pipeline.execute_json(request).await?;
        let chunk: UploadChunkResponse = serde_json::from_value(json).unwrap_or_default();
        if chunk.error_code != 0 {
            error!(
                "上传分片失败: part={}, error_code={}, error_msg={}",
                part_seq, chunk.error_code, chunk.error_msg
            );
            return Err(CloudServiceError::Service {
                code: chunk.error_code,
                message: Some(chunk.error_msg),
                response: Some(Box::new(response)),
            });
        }
        Ok(PartAck {
            content_digest: Some(chunk.md5).filter(|md5| !md5.is_empty()),
            ..PartAck::default()
        })
    }

    async fn commit(&self, session: &UploadSession) -> CloudResult<UploadResult> {
        let path = remote_path_of(session)?;
        let block_list = json_str(&session.extra, "block_list").unwrap_or_else(|| "[]".to_string());
        let request = HttpRequest::post(self.file_url.clone())
            .query("method", "create")
            .form([
                ("path", path),
                ("size", session.total_size.to_string()),
                ("isdir", "0".to_string()),
                ("rtype", "1".to_string()),
                ("uploadid", session.continuation.as_str().to_string()),
                ("block_list", block_list),
            ]);
        let (response, json) = self.pipeline.execute_json(request).await?;
        let id = json_str(&json, "fs_id")
            .ok_or_else(|| CloudServiceError::decode("创建文件响应缺少 fs_id", &response))?;
        let path = json_str(&json, "path").unwrap_or_default();
        let name = json_str(&json, "server_filename")
            .or_else(|| path.rsplit('/').next().map(str::to_string))
            .unwrap_or_else(|| session.local_file.name.clone());
        let item = CloudItem::new(id, name, path.clone(), false)
            .at_path(path)
            .with_size(session.total_size as i64)
            .with_hash(json_str(&json, "md5"))
            .with_raw(json);
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

    fn provider(transport: Arc<ScriptedTransport>) -> BaiduPanProvider {
        BaiduPanProvider::new(ProviderContext::new(Credential::new("u", "tk"), transport))
    }

    fn form_value(request: &HttpRequest, key: &str) -> Option<String> {
        match &request.body {
            HttpBody::Form(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_list_pages_by_offset() {
        let transport = ScriptedTransport::new();
        let first: Vec<Value> = (0..PAGE_LIMIT)
            .map(|i| json!({"server_filename": format!("f{}", i), "path": format!("/d/f{}", i), "fs_id": i, "isdir": 0, "size": 1}))
            .collect();
        transport.push_json(200, json!({"errno": 0, "list": first}));
        transport.push_json(
            200,
            json!({"errno": 0, "list": [{"server_filename": "sub", "path": "/d/sub", "fs_id": 9999, "isdir": 1}]}),
        );
        let provider = provider(Arc::clone(&transport));
        let dir = CloudItem::new("1", "d", "/d", true);

        let items = provider.contents_of_directory(&dir).await.unwrap();

        assert_eq!(items.len(), PAGE_LIMIT as usize + 1);
        assert!(items.last().unwrap().is_directory);
        assert_eq!(items.last().unwrap().path(), "/d/sub");
        let sent = transport.requests();
        assert_eq!(sent[0].query_value("access_token"), Some("tk"));
        assert_eq!(sent[0].query_value("start"), Some("0"));
        assert_eq!(sent[1].query_value("start"), Some("1000"));
    }

    #[tokio::test]
    async fn test_errno_in_200_is_service_error() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"errno": 12, "errmsg": "batch failed"}));
        let provider = provider(Arc::clone(&transport));
        let item = CloudItem::new("1", "a", "/a", false);

        let err = provider.remove_item(&item).await.unwrap_err();
        assert_eq!(err.code(), Some(12));
        assert_eq!(form_value(&transport.requests()[0], "filelist").as_deref(), Some("[\"/a\"]"));
    }

    #[tokio::test]
    async fn test_token_expiry_errno_refreshes() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"errno": -6}));
        transport.push_json(200, json!({"errno": 0, "baidu_name": "alice"}));
        let handler = refresh_fn(|_| async { Ok(Credential::new("u", "tk2")) });
        let provider = BaiduPanProvider::new(
            ProviderContext::new(Credential::new("u", "tk"), Arc::clone(&transport) as _)
                .with_refresh_handler(handler),
        );

        let user = provider.current_user().await.unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(transport.requests()[1].query_value("access_token"), Some("tk2"));
    }

    #[tokio::test]
    async fn test_download_link_appends_token() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({"errno": 0, "list": [{"filename": "a", "path": "/a", "fs_id": 1, "isdir": 0, "dlink": "https://d.pcs.baidu.com/file/x?fid=1"}]}),
        );
        let provider = provider(Arc::clone(&transport));
        let download = provider
            .download_request(&CloudItem::new("1", "a", "/a", false))
            .await
            .unwrap();
        assert_eq!(download.url, "https://d.pcs.baidu.com/file/x?fid=1&access_token=tk");
        assert_eq!(download.headers, vec![("User-Agent".to_string(), "pan.baidu.com".to_string())]);

        let folder = CloudItem::new("2", "d", "/d", true);
        assert!(matches!(
            provider.attributes_of_item(&folder).await,
            Err(CloudServiceError::Unsupported)
        ));
    }

    #[tokio::test]
    async fn test_quota_url() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"errno": 0, "total": 100, "free": 40}));
        let provider = provider(Arc::clone(&transport));
        let space = provider.space_information().await.unwrap();
        assert_eq!(space.available_space, 40);
        assert_eq!(transport.requests()[0].url, "https://pan.baidu.com/api/quota");
    }

    fn temp_file(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![1u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_chunked_upload_then_move_from_app_dir() {
        let size = (BAIDU_PART_SIZE * 2 + 10) as usize;
        let file = temp_file(size);
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"errno": 0, "uploadid": "up1", "return_type": 1}));
        for md5 in ["m0", "m1", "m2"] {
            transport.push_json(200, json!({"md5": md5}));
        }
        transport.push_json(
            200,
            json!({"errno": 0, "fs_id": 42, "path": "/apps/demo/big.bin", "server_filename": "big.bin"}),
        );
        transport.push_json(200, json!({"errno": 0, "info": []}));
        let provider = provider(Arc::clone(&transport)).with_app_name("demo");
        let local = LocalFile::open_named(file.path(), "big.bin").await.unwrap();
        let dir = CloudItem::new("7", "music", "/music", true);

        let result = provider.upload_local(local, &dir, UploadOptions::default()).await.unwrap();

        assert_eq!(result.item.id, "42");
        assert_eq!(result.item.path(), "/music/big.bin");
        let sent = transport.requests();
        assert_eq!(sent.len(), 6);
        assert_eq!(form_value(&sent[0], "path").as_deref(), Some("/apps/demo/big.bin"));
        let blocks: Vec<String> =
            serde_json::from_str(&form_value(&sent[0], "block_list").unwrap()).unwrap();
        assert_eq!(blocks.len(), 3);
        let seqs: Vec<_> = sent[1..4].iter().map(|r| r.query_value("partseq").unwrap().to_string()).collect();
        assert_eq!(seqs, vec!["0", "1", "2"]);
        assert_eq!(sent[3].body.payload_len(), 10);
        assert_eq!(sent[4].query_value("method"), Some("create"));
        assert_eq!(sent[5].query_value("opera"), Some("move"));
    }

    #[tokio::test]
    async fn test_rapid_upload_skips_parts() {
        let file = temp_file(32);
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({"errno": 0, "return_type": 2, "info": {"fs_id": 5, "path": "/docs/a.txt"}}),
        );
        let provider = provider(Arc::clone(&transport));
        let local = LocalFile::open_named(file.path(), "a.txt").await.unwrap();
        let dir = CloudItem::new("3", "docs", "/docs", true);

        let result = provider.upload_local(local, &dir, UploadOptions::default()).await.unwrap();
        assert!(result.rapid_upload);
        assert_eq!(result.item.id, "5");
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_part_error_code_aborts_upload() {
        let file = temp_file(16);
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"errno": 0, "uploadid": "up1", "return_type": 1}));
        transport.push_json(200, json!({"error_code": 31363, "error_msg": "block miss in superfile2"}));
        let provider = provider(Arc::clone(&transport));
        let local = LocalFile::open(file.path()).await.unwrap();

        let err = provider
            .upload_local(local, &provider.root_item(), UploadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(31363));
        assert_eq!(transport.request_count(), 2);
    }
}
