// 测试用脚本化传输层
//
// 按顺序回放预置响应，队列为空时交给路由闭包处理，并记录所有请求

use crate::error::{CloudResult, CloudServiceError};
use crate::http::transport::HttpTransport;
use crate::http::types::{HttpRequest, RawResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

type Responder = Arc<dyn Fn(&HttpRequest) -> CloudResult<RawResponse> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<CloudResult<RawResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
    responder: Mutex<Option<Responder>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 使用路由闭包应答（适合并发分片等顺序不确定的场景）
    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> CloudResult<RawResponse> + Send + Sync + 'static,
    {
        let transport = Self::default();
        *transport.responder.lock() = Some(Arc::new(responder));
        Arc::new(transport)
    }

    pub fn push(&self, result: CloudResult<RawResponse>) {
        self.queue.lock().push_back(result);
    }

    pub fn push_json(&self, status: u16, value: Value) {
        self.push(Ok(RawResponse::from_json(status, &value)));
    }

    pub fn push_response(&self, response: RawResponse) {
        self.push(Ok(response));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> CloudResult<RawResponse> {
        self.requests.lock().push(request.clone());
        if let Some(progress) = &request.progress {
            progress(request.body.payload_len());
        }
        if let Some(next) = self.queue.lock().pop_front() {
            return next;
        }
        let responder = self.responder.lock().clone();
        match responder {
            Some(responder) => responder(request),
            None => Err(CloudServiceError::transport(format!(
                "no scripted response for {} {}",
                request.method, request.url
            ))),
        }
    }
}
