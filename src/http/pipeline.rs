// 请求管线
//
// 注入凭证 -> 发送 -> 授权失效时刷新并重试一次 -> 交给错误分类器

use crate::auth::{
    replace_cookie, set_cookie_pair, CookieRefreshedFn, Credential, CredentialCell, RefreshHandler,
};
use crate::common::{RefreshCoordinator, RefreshCoordinatorConfig};
use crate::error::{CloudResult, CloudServiceError};
use crate::http::transport::HttpTransport;
use crate::http::types::{HttpRequest, RawResponse};
use crate::provider::classifier::ResponseClassifier;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 自定义签名函数（签名头随凭证变化，每次发送前重新计算）
pub type SignFn = Arc<dyn Fn(&mut HttpRequest, &Credential) + Send + Sync>;

/// 凭证注入方式
#[derive(Clone)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// Bearer 头，同时把令牌放进指定查询参数
    BearerWithQuery(&'static str),
    /// 只放进查询参数
    Query(&'static str),
    /// 放进指定请求头（不带 Bearer 前缀）
    Header(&'static str),
    /// 令牌为整串 Cookie，放进 `Cookie` 请求头
    Cookie,
    /// 由 provider 计算签名头
    Custom(SignFn),
}

impl fmt::Debug for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Bearer => write!(f, "Bearer"),
            AuthScheme::BearerWithQuery(name) => write!(f, "BearerWithQuery({})", name),
            AuthScheme::Query(name) => write!(f, "Query({})", name),
            AuthScheme::Header(name) => write!(f, "Header({})", name),
            AuthScheme::Cookie => write!(f, "Cookie"),
            AuthScheme::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// 请求管线
///
/// 每个 provider 实例独占一个管线；凭证单元可在多个并发请求间共享
pub struct RequestPipeline {
    transport: Arc<dyn HttpTransport>,
    credential: Arc<CredentialCell>,
    refresh: Option<Arc<dyn RefreshHandler>>,
    classifier: Arc<dyn ResponseClassifier>,
    auth: AuthScheme,
    coordinator: RefreshCoordinator,
    /// 允许服务端通过 Set-Cookie 轮换的 Cookie 名称
    rotating_cookies: Vec<&'static str>,
    cookie_refreshed: Option<CookieRefreshedFn>,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credential: Credential,
        classifier: Arc<dyn ResponseClassifier>,
    ) -> Self {
        Self {
            transport,
            credential: Arc::new(CredentialCell::new(credential)),
            refresh: None,
            classifier,
            auth: AuthScheme::Bearer,
            coordinator: RefreshCoordinator::default(),
            rotating_cookies: Vec::new(),
            cookie_refreshed: None,
        }
    }

    pub fn with_auth(mut self, auth: AuthScheme) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_refresh_handler(mut self, handler: Option<Arc<dyn RefreshHandler>>) -> Self {
        self.refresh = handler;
        self
    }

    pub fn with_refresh_config(mut self, config: RefreshCoordinatorConfig) -> Self {
        self.coordinator = RefreshCoordinator::new(config);
        self
    }

    /// 响应中带有这些名称的 Set-Cookie 时，替换凭证中的同名字段
    pub fn with_cookie_rotation(mut self, names: &[&'static str]) -> Self {
        self.rotating_cookies = names.to_vec();
        self
    }

    pub fn with_cookie_refreshed_handler(mut self, handler: Option<CookieRefreshedFn>) -> Self {
        self.cookie_refreshed = handler;
        self
    }

    /// 当前凭证快照
    pub fn credential(&self) -> Arc<Credential> {
        self.credential.credential()
    }

    /// 由调用方替换凭证（例如重新登录后）
    pub fn set_credential(&self, credential: Credential) {
        self.credential.replace(credential);
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        Arc::clone(&self.transport)
    }

    /// 刷新回调被实际调用的次数
    pub fn refresh_count(&self) -> u64 {
        self.coordinator.refresh_count()
    }

    /// 执行一次逻辑请求
    ///
    /// # 返回
    /// - 分类器未认领的响应（包括非 2xx）作为成功返回
    /// - 授权失效且刷新失败时返回刷新错误
    pub async fn execute(&self, request: HttpRequest) -> CloudResult<RawResponse> {
        let (credential, generation) = self.credential.snapshot();
        let response = self.send(&request, &credential).await?;

        if !request.authorize || !self.classifier.is_unauthorized(&response) {
            return self.classify(response);
        }

        let handler = match &self.refresh {
            Some(handler) => handler,
            None => {
                warn!("授权失效且未配置刷新回调: {} {}", request.method, request.url);
                return Err(CloudServiceError::Unauthorized {
                    response: Box::new(response),
                });
            }
        };

        info!("授权失效，刷新凭证后重试: {} {}", request.method, request.url);
        let credential = self
            .coordinator
            .refresh(&self.credential, generation, handler.as_ref())
            .await?;

        let response = self.send(&request, &credential).await?;
        if self.classifier.is_unauthorized(&response) {
            warn!("刷新后仍然授权失效: {} {}", request.method, request.url);
            return Err(CloudServiceError::Unauthorized {
                response: Box::new(response),
            });
        }
        self.classify(response)
    }

    /// 执行请求并把响应体解析为 JSON
    pub async fn execute_json(&self, request: HttpRequest) -> CloudResult<(RawResponse, Value)> {
        let response = self.execute(request).await?;
        match response.json() {
            Some(json) => Ok((response, json)),
            None => Err(CloudServiceError::decode("响应不是有效的 JSON", &response)),
        }
    }

    async fn send(&self, request: &HttpRequest, credential: &Credential) -> CloudResult<RawResponse> {
        let request = self.authorize(request, credential);
        debug!("发送请求: {} {}", request.method, request.url);
        let response = self.transport.send(&request).await?;
        debug!("收到响应: {} {} -> {}", request.method, request.url, response.status());
        if request.authorize {
            self.rotate_cookies(&response);
        }
        Ok(response)
    }

    /// 把响应中轮换的 Cookie 写回凭证单元，变化时通知调用方
    fn rotate_cookies(&self, response: &RawResponse) {
        if self.rotating_cookies.is_empty() {
            return;
        }
        let pairs: Vec<&str> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(set_cookie_pair)
            .filter(|pair| {
                let name = pair.split('=').next().unwrap_or_default();
                self.rotating_cookies.iter().any(|rotating| *rotating == name)
            })
            .collect();
        if pairs.is_empty() {
            return;
        }

        let updated = self.credential.update_with(|current| {
            let mut cookie = current.token.clone();
            let mut changed = false;
            for pair in &pairs {
                if let Some(next) = replace_cookie(&cookie, pair) {
                    cookie = next;
                    changed = true;
                }
            }
            changed.then(|| Credential {
                token: cookie,
                ..current.clone()
            })
        });

        if let Some((credential, generation)) = updated {
            info!("服务端轮换了 Cookie，已更新凭证 (generation={})", generation);
            if let Some(handler) = &self.cookie_refreshed {
                handler(&credential.token);
            }
        }
    }

    fn authorize(&self, request: &HttpRequest, credential: &Credential) -> HttpRequest {
        let mut request = request.clone();
        if !request.authorize {
            return request;
        }
        match &self.auth {
            AuthScheme::Bearer => {
                request.set_header("Authorization", format!("Bearer {}", credential.token));
            }
            AuthScheme::BearerWithQuery(name) => {
                request.set_header("Authorization", format!("Bearer {}", credential.token));
                request.query.retain(|(k, _)| k != name);
                request.query.push((name.to_string(), credential.token.clone()));
            }
            AuthScheme::Query(name) => {
                request.query.retain(|(k, _)| k != name);
                request.query.push((name.to_string(), credential.token.clone()));
            }
            AuthScheme::Header(name) => {
                request.set_header(*name, credential.token.clone());
            }
            AuthScheme::Cookie => {
                request.set_header("Cookie", credential.token.clone());
            }
            AuthScheme::Custom(sign) => sign(&mut request, credential),
        }
        request
    }

    fn classify(&self, response: RawResponse) -> CloudResult<RawResponse> {
        match self.classifier.classify(&response) {
            Some(failure) => {
                warn!(
                    "服务端返回业务错误: status={}, code={}, message={:?}",
                    response.status(),
                    failure.code,
                    failure.message
                );
                Err(CloudServiceError::Service {
                    code: failure.code,
                    message: failure.message,
                    response: Some(Box::new(response)),
                })
            }
            None => Ok(response),
        }
    }
}
