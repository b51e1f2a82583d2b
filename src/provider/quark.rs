// 夸克网盘
//
// 网页接口，凭证为浏览器登录后的整串 Cookie；服务端会通过 Set-Cookie 轮换 __puus

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, RawResponse, RequestPipeline};
use crate::provider::classifier::QuarkClassifier;
use crate::provider::{
    collect_all, join_path, json_i64, json_str, CloudBatching, CloudFileProvider, CloudItem,
    CloudSearching, CloudSpaceInformation, CloudUser, DownloadRequest, Page, ProviderContext,
    UploadOptions, UploadResult,
};
use crate::uploader::LocalFile;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

const PAGE_SIZE: i64 = 100;

/// 会被服务端轮换的 Cookie 字段
const ROTATING_COOKIES: &[&str] = &["__puus"];

pub struct QuarkProvider {
    pipeline: Arc<RequestPipeline>,
    api: String,
}

impl QuarkProvider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context
            .pipeline(Arc::new(QuarkClassifier), AuthScheme::Cookie)
            .with_cookie_rotation(ROTATING_COOKIES);
        Self {
            pipeline: Arc::new(pipeline),
            api: context.endpoints.quark_api.trim_end_matches('/').to_string(),
        }
    }

    /// 每个请求都带 pr/fr 参数与网页端的请求头
    fn request(&self, request: HttpRequest) -> HttpRequest {
        request
            .query("pr", "ucpro")
            .query("fr", "pc")
            .header("Accept", "application/json, text/plain, */*")
            .header("Referer", "https://pan.quark.cn/")
    }

    fn get(&self, path: &str) -> HttpRequest {
        self.request(HttpRequest::get(format!("{}{}", self.api, path)))
    }

    async fn post(&self, path: &str, body: Value) -> CloudResult<RawResponse> {
        let request = self.request(HttpRequest::post(format!("{}{}", self.api, path)));
        self.pipeline.execute(request.json(body)).await
    }

    /// `_page` 从 1 开始，`100 * page >= metadata._total` 时为最后一页
    async fn list_page(&self, directory: &CloudItem, page: Option<String>) -> CloudResult<Page<CloudItem>> {
        let page: i64 = page.and_then(|p| p.parse().ok()).unwrap_or(1);
        let request = self
            .get("/file/sort")
            .query("pdir_fid", &directory.id)
            .query("_size", PAGE_SIZE)
            .query("_fetch_total", 1)
            .query("_page", page);
        let (response, json) = self.pipeline.execute_json(request).await?;
        let items = items_of_list(&json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 data.list", &response))?;

        let total = json.get("metadata").and_then(|m| json_i64(m.get("_total")));
        let next = match total {
            Some(total) if PAGE_SIZE * page < total => Some((page + 1).to_string()),
            _ => None,
        };
        debug!("夸克列表: 目录={}, 第 {} 页, {} 项, 总数={:?}", directory.id, page, items.len(), total);
        Ok(Page::new(items, next))
    }

    fn file_list(items: &[CloudItem]) -> Value {
        json!(items.iter().map(|item| item.id.as_str()).collect::<Vec<_>>())
    }
}

/// 毫秒时间戳
fn parse_millis(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let millis = json_i64(value)?;
    Utc.timestamp_millis_opt(millis).single()
}

fn item_from_json(json: &Value) -> Option<CloudItem> {
    let id = json_str(json, "fid")?;
    let name = json_str(json, "file_name")?;
    let is_directory = json.get("file").and_then(Value::as_bool) == Some(false);
    let item = CloudItem::new(id, name.clone(), name, is_directory)
        .with_size(json_i64(json.get("size")).unwrap_or(-1))
        .with_times(
            parse_millis(json.get("created_at")),
            parse_millis(json.get("l_updated_at")),
        )
        .with_raw(json.clone());
    Some(item)
}

fn items_of_list(json: &Value) -> Option<Vec<CloudItem>> {
    let list = json.get("data")?.get("list")?.as_array()?;
    Some(list.iter().filter_map(item_from_json).collect())
}

#[async_trait]
impl CloudFileProvider for QuarkProvider {
    fn name(&self) -> &'static str {
        "Quark"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("0", "Quark", "/", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    async fn attributes_of_item(&self, _item: &CloudItem) -> CloudResult<CloudItem> {
        Err(CloudServiceError::Unsupported)
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let mut items = collect_all(|page| self.list_page(directory, page)).await?;
        for item in &mut items {
            item.fix_path(directory);
        }
        Ok(items)
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({
            "dir_init_lock": false,
            "dir_path": "",
            "file_name": name,
            "pdir_fid": directory.id,
        });
        self.post("/file", body).await
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        self.post("/file/rename", json!({ "fid": item.id, "file_name": new_name }))
            .await
    }

    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        self.move_items(std::slice::from_ref(item), directory).await
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        self.remove_items(std::slice::from_ref(item)).await
    }

    /// 直链需要携带同一串 Cookie
    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        if item.is_directory {
            return Err(CloudServiceError::Unsupported);
        }
        let request = self
            .request(HttpRequest::post(format!("{}/file/download", self.api)))
            .json(json!({ "fids": [item.id] }));
        let (response, json) = self.pipeline.execute_json(request).await?;
        let url = json
            .get("data")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(|entry| json_str(entry, "download_url"))
            .filter(|url| !url.is_empty())
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 download_url", &response))?;
        Ok(DownloadRequest::new(url).header("Cookie", self.pipeline.credential().token.clone()))
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
impl CloudSearching for QuarkProvider {
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        let request = self.get("/file/search").query("q", keyword);
        let (response, json) = self.pipeline.execute_json(request).await?;
        let mut items = items_of_list(&json)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 data.list", &response))?;
        for item in &mut items {
            let path = join_path("/", &item.name);
            *item = item.clone().at_path(path);
        }
        Ok(items)
    }
}

#[async_trait]
impl CloudBatching for QuarkProvider {
    async fn remove_items(&self, items: &[CloudItem]) -> CloudResult<RawResponse> {
        let body = json!({
            "action_type": 1,
            "exclude_fids": [],
            "filelist": Self::file_list(items),
        });
        self.post("/file/delete", body).await
    }

    async fn move_items(&self, items: &[CloudItem], directory: &CloudItem) -> CloudResult<RawResponse> {
        let body = json!({
            "action_type": 1,
            "exclude_fids": [],
            "filelist": Self::file_list(items),
            "to_pdir_fid": directory.id,
        });
        self.post("/file/move", body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CookieRefreshedFn, Credential};
    use crate::http::testing::ScriptedTransport;
    use crate::http::HttpBody;
    use parking_lot::Mutex;
    use reqwest::Method;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const COOKIE: &str = "__pus=p1; __puus=old; __kp=k1";

    fn provider(transport: Arc<ScriptedTransport>) -> QuarkProvider {
        QuarkProvider::new(ProviderContext::new(Credential::new("", COOKIE), transport))
    }

    fn ok(data: Value) -> Value {
        json!({ "status": 200, "code": 0, "message": "ok", "data": data })
    }

    fn entry(fid: &str, name: &str, file: bool) -> Value {
        let size = if file { 12 } else { 0 };
        json!({
            "fid": fid,
            "file_name": name,
            "file": file,
            "size": size,
            "created_at": 1648195200000i64,
            "l_updated_at": 1648281600000i64
        })
    }

    #[tokio::test]
    async fn test_list_pages_until_total_reached() {
        let transport = ScriptedTransport::new();
        let first: Vec<Value> = (0..100).map(|i| entry(&format!("f{}", i), &format!("{}.txt", i), true)).collect();
        let mut page1 = ok(json!({ "list": first }));
        page1["metadata"] = json!({ "_total": 101 });
        transport.push_json(200, page1);
        let mut page2 = ok(json!({ "list": [entry("d1", "docs", false)] }));
        page2["metadata"] = json!({ "_total": 101 });
        transport.push_json(200, page2);
        let provider = provider(Arc::clone(&transport));

        let root = provider.root_item();
        let items = provider.contents_of_directory(&root).await.unwrap();

        assert_eq!(items.len(), 101);
        let docs = items.last().unwrap();
        assert!(docs.is_directory);
        assert_eq!(docs.path(), "/docs");
        let file = &items[0];
        assert_eq!(file.size, 12);
        assert_eq!(
            file.creation_time.map(|t| t.timestamp()),
            Some(1648195200)
        );

        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].query_value("_page"), Some("1"));
        assert_eq!(sent[1].query_value("_page"), Some("2"));
        assert_eq!(sent[0].query_value("pdir_fid"), Some("0"));
        assert_eq!(sent[0].query_value("pr"), Some("ucpro"));
        assert_eq!(sent[0].header_value("Cookie"), Some(COOKIE));
        assert_eq!(sent[0].header_value("Referer"), Some("https://pan.quark.cn/"));
    }

    #[tokio::test]
    async fn test_list_without_metadata_is_single_page() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, ok(json!({ "list": [entry("f1", "a.txt", true)] })));
        let provider = provider(Arc::clone(&transport));

        let items = provider.contents_of_directory(&provider.root_item()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_rotated_puus_is_used_and_reported() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(RawResponse::from_json(200, &ok(json!({ "list": [] })))
            .with_header("Set-Cookie", "__puus=new; Path=/; HttpOnly")));
        transport.push_json(200, ok(json!({})));
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let handler: CookieRefreshedFn = Arc::new(move |cookie| sink.lock().push(cookie.to_string()));
        let provider = QuarkProvider::new(
            ProviderContext::new(Credential::new("", COOKIE), Arc::clone(&transport) as _)
                .with_cookie_refreshed_handler(handler),
        );

        let root = provider.root_item();
        provider.contents_of_directory(&root).await.unwrap();
        provider.create_folder("new", &root).await.unwrap();

        let rotated = "__pus=p1; __puus=new; __kp=k1";
        assert_eq!(provider.credential().token, rotated);
        assert_eq!(*reported.lock(), vec![rotated.to_string()]);
        assert_eq!(transport.requests()[1].header_value("Cookie"), Some(rotated));
    }

    #[tokio::test]
    async fn test_error_code_is_service_error() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({ "status": 400, "code": 23008, "message": "文件名冲突" }));
        let provider = provider(Arc::clone(&transport));

        let err = provider
            .create_folder("dup", &provider.root_item())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(23008));
    }

    #[tokio::test]
    async fn test_batch_move_and_delete_bodies() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, ok(json!({})));
        transport.push_json(200, ok(json!({})));
        let provider = provider(Arc::clone(&transport));
        let items = vec![
            CloudItem::new("f1", "a", "/a", false),
            CloudItem::new("f2", "b", "/b", false),
        ];
        let target = CloudItem::new("d9", "dst", "/dst", true);

        crate::provider::move_items(&provider, &items, &target).await.unwrap();
        crate::provider::remove_items(&provider, &items).await.unwrap();

        let sent = transport.requests();
        assert!(sent[0].url.ends_with("/file/move"));
        match &sent[0].body {
            HttpBody::Json(body) => {
                assert_eq!(body["filelist"], json!(["f1", "f2"]));
                assert_eq!(body["to_pdir_fid"], "d9");
                assert_eq!(body["action_type"], 1);
            }
            other => panic!("unexpected body: {:?}", other),
        }
        assert!(sent[1].url.ends_with("/file/delete"));
        match &sent[1].body {
            HttpBody::Json(body) => {
                assert_eq!(body["filelist"], json!(["f1", "f2"]));
                assert_eq!(body["exclude_fids"], json!([]));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_carries_cookie() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            ok(json!([{ "fid": "f1", "download_url": "https://dl.quark.cn/f1" }])),
        );
        let provider = provider(Arc::clone(&transport));

        let request = provider
            .download_request(&CloudItem::new("f1", "a.txt", "/a.txt", false))
            .await
            .unwrap();
        assert_eq!(request.url, "https://dl.quark.cn/f1");
        assert_eq!(request.headers, vec![("Cookie".to_string(), COOKIE.to_string())]);

        let sent = transport.requests();
        assert_eq!(sent[0].method, Method::POST);
        assert!(matches!(&sent[0].body, HttpBody::Json(body) if body["fids"] == json!(["f1"])));
    }

    #[tokio::test]
    async fn test_search_uses_query_keyword() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, ok(json!({ "list": [entry("f1", "report.pdf", true)] })));
        let provider = provider(Arc::clone(&transport));

        let items = crate::provider::search_files(&provider, "report").await.unwrap();
        assert_eq!(items[0].path(), "/report.pdf");
        assert_eq!(transport.requests()[0].query_value("q"), Some("report"));
    }

    #[tokio::test]
    async fn test_upload_is_unsupported_without_requests() {
        let transport = ScriptedTransport::new();
        let provider = provider(Arc::clone(&transport));
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"hello").unwrap();

        let err = provider
            .upload_file(temp.path(), &provider.root_item(), UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudServiceError::Unsupported));
        assert_eq!(transport.request_count(), 0);
    }
}
