// 访问凭证与可替换的凭证单元

use crate::error::CloudResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// 访问凭证
///
/// 刷新后整体替换，不在原值上修改
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// 账号标识（用户名/用户 ID）
    pub principal: String,
    /// Bearer 访问令牌
    pub token: String,
    /// 刷新令牌
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(principal: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            token: token.into(),
            refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("token", &mask(&self.token))
            .field("refresh_token", &self.refresh_token.as_deref().map(mask))
            .finish()
    }
}

/// 日志中只保留令牌前 4 位
fn mask(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}***", prefix)
}

/// 凭证单元
///
/// 请求构造时读取快照；每次替换递增 generation，用于识别过期的刷新结果
#[derive(Debug)]
pub struct CredentialCell {
    current: RwLock<(Arc<Credential>, u64)>,
}

impl CredentialCell {
    pub fn new(credential: Credential) -> Self {
        Self {
            current: RwLock::new((Arc::new(credential), 0)),
        }
    }

    /// 当前凭证及其 generation
    pub fn snapshot(&self) -> (Arc<Credential>, u64) {
        let guard = self.current.read();
        (Arc::clone(&guard.0), guard.1)
    }

    pub fn credential(&self) -> Arc<Credential> {
        Arc::clone(&self.current.read().0)
    }

    pub fn generation(&self) -> u64 {
        self.current.read().1
    }

    /// 无条件替换凭证，返回新 generation
    pub fn replace(&self, credential: Credential) -> u64 {
        let mut guard = self.current.write();
        let generation = guard.1 + 1;
        *guard = (Arc::new(credential), generation);
        generation
    }

    /// 仅当 generation 仍为 `expected` 时替换
    ///
    /// # 返回
    /// - `Ok`: 替换成功后的凭证与 generation
    /// - `Err`: 已被更新的凭证替换过，返回当前值，传入的凭证被丢弃
    pub fn replace_if_current(
        &self,
        expected: u64,
        credential: Credential,
    ) -> Result<(Arc<Credential>, u64), (Arc<Credential>, u64)> {
        let mut guard = self.current.write();
        if guard.1 != expected {
            return Err((Arc::clone(&guard.0), guard.1));
        }
        let generation = guard.1 + 1;
        *guard = (Arc::new(credential), generation);
        Ok((Arc::clone(&guard.0), generation))
    }

    /// 在写锁内基于当前凭证计算新凭证，`update` 返回 None 时不替换
    ///
    /// 用于响应驱动的增量更新（例如服务端轮换的 Cookie），不会覆盖并发写入的新值
    pub fn update_with<F>(&self, update: F) -> Option<(Arc<Credential>, u64)>
    where
        F: FnOnce(&Credential) -> Option<Credential>,
    {
        let mut guard = self.current.write();
        let next = update(&guard.0)?;
        let generation = guard.1 + 1;
        *guard = (Arc::new(next), generation);
        Some((Arc::clone(&guard.0), generation))
    }
}

/// 凭证刷新回调，由调用方提供并负责持久化新凭证
#[async_trait]
pub trait RefreshHandler: Send + Sync {
    async fn refresh(&self, current: &Credential) -> CloudResult<Credential>;
}

struct FnRefresh<F>(F);

#[async_trait]
impl<F, Fut> RefreshHandler for FnRefresh<F>
where
    F: Fn(Option<String>) -> Fut + Send + Sync,
    Fut: Future<Output = CloudResult<Credential>> + Send,
{
    async fn refresh(&self, current: &Credential) -> CloudResult<Credential> {
        (self.0)(current.refresh_token.clone()).await
    }
}

/// 将 `refresh(refresh_token) -> Result<Credential>` 形式的闭包包装为刷新回调
pub fn refresh_fn<F, Fut>(f: F) -> Arc<dyn RefreshHandler>
where
    F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CloudResult<Credential>> + Send + 'static,
{
    Arc::new(FnRefresh(f))
}
