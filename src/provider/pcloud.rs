// pCloud
//
// 文件与文件夹的接口分开（*file / *folder）；上传为单个 multipart 请求

use crate::error::{CloudResult, CloudServiceError};
use crate::http::{AuthScheme, HttpRequest, MultipartBody, RawResponse, RequestPipeline};
use crate::provider::classifier::PCloudClassifier;
use crate::provider::{
    join_path, json_i64, json_str, require_str, upload_in_one_request, CloudCopying,
    CloudFileProvider, CloudItem, CloudSearching, CloudSpaceInformation, CloudUser,
    DownloadRequest, ProviderContext, UploadOptions, UploadResult,
};
use crate::uploader::LocalFile;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct PCloudProvider {
    pipeline: Arc<RequestPipeline>,
    api: String,
}

/// `Thu, 21 Mar 2013 18:31:40 +0000`
fn parse_pcloud_date(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let s = value.and_then(Value::as_str)?;
    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn item_from_json(json: &Value) -> Option<CloudItem> {
    let name = json_str(json, "name")?;
    let is_directory = json.get("isfolder").and_then(Value::as_bool).unwrap_or(false);
    let id = if is_directory {
        json_str(json, "folderid")
    } else {
        json_str(json, "fileid")
    }
    .or_else(|| json_str(json, "id"))
    .unwrap_or_default();
    let path = json_str(json, "path").unwrap_or_else(|| name.clone());
    let item = CloudItem::new(id, name, path, is_directory)
        .with_size(json_i64(json.get("size")).unwrap_or(-1))
        .with_hash(json_str(json, "hash"))
        .with_times(
            parse_pcloud_date(json.get("created")),
            parse_pcloud_date(json.get("modified")),
        )
        .with_raw(json.clone());
    Some(item)
}

/// 接口带 path 字段时即为完整路径，否则按父目录补全
fn place_in(item: CloudItem, parent_path: &str) -> CloudItem {
    let path = match item.raw_str("path") {
        Some(path) => path.to_string(),
        None => join_path(parent_path, &item.name),
    };
    item.at_path(path)
}

/// 递归展开 listfolder(recursive=1) 的 contents
fn flatten(contents: &[Value], parent_path: &str, out: &mut Vec<CloudItem>) {
    for entry in contents {
        let Some(item) = item_from_json(entry).map(|item| place_in(item, parent_path)) else {
            continue;
        };
        let children = entry.get("contents").and_then(Value::as_array);
        let path = item.path().to_string();
        out.push(item);
        if let Some(children) = children {
            flatten(children, &path, out);
        }
    }
}

/// file 或 folder 的方法名与 id 参数名
fn target_of(item: &CloudItem, file_method: &'static str, folder_method: &'static str) -> (&'static str, &'static str) {
    if item.is_directory {
        (folder_method, "folderid")
    } else {
        (file_method, "fileid")
    }
}

impl PCloudProvider {
    pub fn new(context: ProviderContext) -> Self {
        let pipeline = context.pipeline(Arc::new(PCloudClassifier), AuthScheme::Bearer);
        Self {
            pipeline: Arc::new(pipeline),
            api: context.endpoints.pcloud_api.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.api, method)
    }

    async fn call(&self, method: &str, fields: Vec<(&str, String)>) -> CloudResult<(RawResponse, Value)> {
        debug!("pCloud 调用: {}", method);
        let request = HttpRequest::post(self.url(method)).form(fields);
        self.pipeline.execute_json(request).await
    }

    async fn list_folder(&self, folder_id: &str, recursive: bool) -> CloudResult<(RawResponse, Value)> {
        let mut request = HttpRequest::get(self.url("listfolder")).query("folderid", folder_id);
        if recursive {
            request = request.query("recursive", 1);
        }
        self.pipeline.execute_json(request).await
    }

    async fn user_info(&self) -> CloudResult<(RawResponse, Value)> {
        self.pipeline
            .execute_json(HttpRequest::get(self.url("userinfo")))
            .await
    }
}

#[async_trait]
impl CloudFileProvider for PCloudProvider {
    fn name(&self) -> &'static str {
        "pCloud"
    }

    fn root_item(&self) -> CloudItem {
        CloudItem::new("0", "pCloud", "/", true)
    }

    fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// 文件用 stat，文件夹用不含文件的 listfolder
    async fn attributes_of_item(&self, item: &CloudItem) -> CloudResult<CloudItem> {
        let request = if item.is_directory {
            HttpRequest::get(self.url("listfolder"))
                .query("folderid", &item.id)
                .query("nofiles", 1)
        } else {
            HttpRequest::get(self.url("stat")).query("fileid", &item.id)
        };
        let (response, json) = self.pipeline.execute_json(request).await?;
        json.get("metadata")
            .and_then(item_from_json)
            .map(|found| {
                if found.raw_str("path").is_some() {
                    place_in(found, "")
                } else {
                    found.at_path(item.path())
                }
            })
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 metadata", &response))
    }

    async fn contents_of_directory(&self, directory: &CloudItem) -> CloudResult<Vec<CloudItem>> {
        let (response, json) = self.list_folder(&directory.id, false).await?;
        let contents = json
            .get("metadata")
            .and_then(|metadata| metadata.get("contents"))
            .and_then(Value::as_array)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少目录内容", &response))?;
        Ok(contents
            .iter()
            .filter_map(item_from_json)
            .map(|item| place_in(item, directory.path()))
            .collect())
    }

    async fn create_folder(&self, name: &str, directory: &CloudItem) -> CloudResult<RawResponse> {
        let fields = vec![("folderid", directory.id.clone()), ("name", name.to_string())];
        let (response, _) = self.call("createfolder", fields).await?;
        Ok(response)
    }

    async fn rename_item(&self, item: &CloudItem, new_name: &str) -> CloudResult<RawResponse> {
        let (method, id_key) = target_of(item, "renamefile", "renamefolder");
        let fields = vec![(id_key, item.id.clone()), ("toname", new_name.to_string())];
        let (response, _) = self.call(method, fields).await?;
        Ok(response)
    }

    /// 移动同样走 rename*，只给目标文件夹
    async fn move_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let (method, id_key) = target_of(item, "renamefile", "renamefolder");
        let fields = vec![(id_key, item.id.clone()), ("tofolderid", directory.id.clone())];
        let (response, _) = self.call(method, fields).await?;
        Ok(response)
    }

    async fn remove_item(&self, item: &CloudItem) -> CloudResult<RawResponse> {
        let (method, id_key) = target_of(item, "deletefile", "deletefolderrecursive");
        let (response, _) = self.call(method, vec![(id_key, item.id.clone())]).await?;
        Ok(response)
    }

    async fn download_request(&self, item: &CloudItem) -> CloudResult<DownloadRequest> {
        if item.is_directory {
            return Err(CloudServiceError::Unsupported);
        }
        let request = HttpRequest::get(self.url("getfilelink")).query("fileid", &item.id);
        let (response, json) = self.pipeline.execute_json(request).await?;
        let path = require_str(&json, "path", &response)?;
        let host = json
            .get("hosts")
            .and_then(|hosts| hosts.get(0))
            .and_then(Value::as_str)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少下载主机", &response))?;
        Ok(DownloadRequest::new(format!("https://{}{}", host, path)))
    }

    async fn current_user(&self) -> CloudResult<CloudUser> {
        let (response, json) = self.user_info().await?;
        let username = require_str(&json, "email", &response)?;
        Ok(CloudUser {
            username,
            raw_attributes: json,
        })
    }

    async fn space_information(&self) -> CloudResult<CloudSpaceInformation> {
        let (response, json) = self.user_info().await?;
        let total = json_i64(json.get("quota"))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少 quota", &response))?;
        let used = json_i64(json.get("usedquota")).unwrap_or(0);
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
        let url = self.url("uploadfile");
        let folder_id = directory.id.clone();
        let name = file.name.clone();
        let response = upload_in_one_request(&self.pipeline, &file, &options, move |data| {
            HttpRequest::post(url).multipart(
                MultipartBody::new()
                    .text("folderid", folder_id)
                    .text("filename", name.clone())
                    .text("nopartial", "1")
                    .file("file", name, data),
            )
        })
        .await?;

        let item = response
            .json()
            .as_ref()
            .and_then(|json| json.get("metadata"))
            .and_then(|metadata| metadata.get(0))
            .and_then(item_from_json)
            .map(|item| place_in(item, directory.path()))
            .ok_or_else(|| CloudServiceError::decode("响应中缺少上传后的文件", &response))?;
        Ok(UploadResult {
            item,
            response: Some(response),
            rapid_upload: false,
        })
    }

    fn as_copying(&self) -> Option<&dyn CloudCopying> {
        Some(self)
    }

    fn as_searching(&self) -> Option<&dyn CloudSearching> {
        Some(self)
    }
}

#[async_trait]
impl CloudCopying for PCloudProvider {
    async fn copy_item(&self, item: &CloudItem, directory: &CloudItem) -> CloudResult<RawResponse> {
        let (method, id_key) = target_of(item, "copyfile", "copyfolder");
        let fields = vec![(id_key, item.id.clone()), ("tofolderid", directory.id.clone())];
        let (response, _) = self.call(method, fields).await?;
        Ok(response)
    }
}

#[async_trait]
impl CloudSearching for PCloudProvider {
    /// 没有搜索接口：递归列出根目录后按名称过滤（不区分大小写）
    async fn search_files(&self, keyword: &str) -> CloudResult<Vec<CloudItem>> {
        let root = self.root_item();
        let (response, json) = self.list_folder(&root.id, true).await?;
        let contents = json
            .get("metadata")
            .and_then(|metadata| metadata.get("contents"))
            .and_then(Value::as_array)
            .ok_or_else(|| CloudServiceError::decode("响应中缺少目录内容", &response))?;
        let mut all = Vec::new();
        flatten(contents, root.path(), &mut all);

        let keyword = keyword.to_lowercase();
        let found: Vec<CloudItem> = all
            .into_iter()
            .filter(|item| item.name.to_lowercase().contains(&keyword))
            .collect();
        debug!("pCloud 本地搜索: 关键字={}, 命中 {} 项", keyword, found.len());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::common::ProgressReport;
    use crate::http::testing::ScriptedTransport;
    use crate::http::{BodyData, HttpBody};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn provider(transport: Arc<ScriptedTransport>) -> PCloudProvider {
        PCloudProvider::new(ProviderContext::new(Credential::new("u", "tok"), transport))
    }

    fn form_of(request: &HttpRequest) -> Vec<(String, String)> {
        match &request.body {
            HttpBody::Form(fields) => fields.clone(),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_parse_date() {
        let date = parse_pcloud_date(Some(&json!("Thu, 21 Mar 2013 18:31:40 +0000"))).unwrap();
        assert_eq!(date.to_rfc3339(), "2013-03-21T18:31:40+00:00");
    }

    #[tokio::test]
    async fn test_list_builds_paths_and_ids() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({"result": 0, "metadata": {"contents": [
                {"name": "Music", "isfolder": true, "folderid": 14, "fileid": 99},
                {"name": "a.mp3", "isfolder": false, "fileid": 15, "size": 3,
                 "hash": 12345, "modified": "Thu, 21 Mar 2013 18:31:40 +0000"}
            ]}}),
        );
        let provider = provider(Arc::clone(&transport));
        let dir = CloudItem::new("7", "media", "/media", true);

        let items = provider.contents_of_directory(&dir).await.unwrap();

        assert_eq!(items[0].id, "14");
        assert!(items[0].is_directory);
        assert_eq!(items[1].id, "15");
        assert_eq!(items[1].path(), "/media/a.mp3");
        assert_eq!(items[1].content_hash.as_deref(), Some("12345"));
        assert!(items[1].modification_time.is_some());
        assert_eq!(transport.requests()[0].query_value("folderid"), Some("7"));
    }

    #[tokio::test]
    async fn test_result_code_is_service_error() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"result": 2005, "error": "Directory does not exist."}));
        let provider = provider(Arc::clone(&transport));

        let err = provider
            .remove_item(&CloudItem::new("3", "gone", "/gone", true))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some(2005));
        let sent = &transport.requests()[0];
        assert!(sent.url.ends_with("/deletefolderrecursive"));
        assert_eq!(form_of(sent), vec![("folderid".to_string(), "3".to_string())]);
    }

    #[tokio::test]
    async fn test_move_and_copy_target_folder() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({"result": 0}));
        transport.push_json(200, json!({"result": 0}));
        let provider = provider(Arc::clone(&transport));
        let file = CloudItem::new("15", "a.mp3", "/a.mp3", false);
        let dir = CloudItem::new("14", "Music", "/Music", true);

        provider.move_item(&file, &dir).await.unwrap();
        crate::provider::copy_item(&provider, &dir, &provider.root_item())
            .await
            .unwrap();

        let sent = transport.requests();
        assert!(sent[0].url.ends_with("/renamefile"));
        assert!(form_of(&sent[0]).contains(&("tofolderid".to_string(), "14".to_string())));
        assert!(sent[1].url.ends_with("/copyfolder"));
        assert!(form_of(&sent[1]).contains(&("folderid".to_string(), "14".to_string())));
    }

    #[tokio::test]
    async fn test_download_link_from_hosts() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({"result": 0, "path": "/cBZ/a.mp3", "hosts": ["p-def1.pcloud.com", "p-def2.pcloud.com"]}),
        );
        let provider = provider(Arc::clone(&transport));

        let download = provider
            .download_request(&CloudItem::new("15", "a.mp3", "/a.mp3", false))
            .await
            .unwrap();

        assert_eq!(download.url, "https://p-def1.pcloud.com/cBZ/a.mp3");
        assert!(matches!(
            provider
                .download_request(&CloudItem::new("14", "d", "/d", true))
                .await,
            Err(CloudServiceError::Unsupported)
        ));
    }

    #[tokio::test]
    async fn test_search_walks_recursive_listing() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({"result": 0, "metadata": {"contents": [
                {"name": "Photos", "isfolder": true, "folderid": 1, "contents": [
                    {"name": "Beach.JPG", "isfolder": false, "fileid": 2},
                    {"name": "notes.txt", "isfolder": false, "fileid": 3}
                ]},
                {"name": "beach-trip", "isfolder": true, "folderid": 4, "contents": []}
            ]}}),
        );
        let provider = provider(Arc::clone(&transport));

        let found = crate::provider::search_files(&provider, "beach").await.unwrap();

        let paths: Vec<&str> = found.iter().map(|item| item.path()).collect();
        assert_eq!(paths, vec!["/Photos/Beach.JPG", "/beach-trip"]);
        assert_eq!(transport.requests()[0].query_value("recursive"), Some("1"));
    }

    #[tokio::test]
    async fn test_upload_single_request_with_progress() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            200,
            json!({"result": 0, "metadata": [{"name": "a.bin", "isfolder": false, "fileid": 50, "size": 32}]}),
        );
        let provider = provider(Arc::clone(&transport));
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[9u8; 32]).unwrap();
        file.flush().unwrap();
        let local = LocalFile::open_named(file.path(), "a.bin").await.unwrap();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let options = UploadOptions::default()
            .with_progress(Arc::new(move |report: ProgressReport| sink.lock().push(report.completed_bytes)));

        let result = provider
            .upload_local(local, &provider.root_item(), options)
            .await
            .unwrap();

        assert_eq!(result.item.id, "50");
        assert_eq!(result.item.path(), "/a.bin");
        assert_eq!(reports.lock().last().copied(), Some(32));
        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        match &sent[0].body {
            HttpBody::Multipart(form) => {
                assert!(form.fields.contains(&("folderid".to_string(), "0".to_string())));
                let part = form.file.as_ref().unwrap();
                assert_eq!(part.data.len(), 32);
                assert!(matches!(part.data, BodyData::File { .. }));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }
}
