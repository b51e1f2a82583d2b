//! 凭证刷新协调器
//!
//! 防止多个请求同时遇到 401 时重复刷新
//! ⚠️ 刷新结果按 generation 比较，过期的刷新结果不会覆盖更新的凭证

use crate::auth::{Credential, CredentialCell, RefreshHandler};
use crate::error::CloudResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 刷新协调器配置
#[derive(Debug, Clone)]
pub struct RefreshCoordinatorConfig {
    /// 是否串行化刷新（同一时刻只有一个刷新在执行）
    pub single_flight: bool,
}

impl Default for RefreshCoordinatorConfig {
    fn default() -> Self {
        Self {
            single_flight: true,
        }
    }
}

/// 凭证刷新协调器
///
/// 核心功能：
/// 1. 串行化刷新：后到的请求在锁内发现 generation 已变化时直接复用新凭证
/// 2. 即使关闭串行化，过期的刷新结果也会被丢弃
#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    lock: Mutex<()>,
    /// 实际调用刷新回调的次数
    refresh_count: AtomicU64,
    config: RefreshCoordinatorConfig,
}

impl RefreshCoordinator {
    pub fn new(config: RefreshCoordinatorConfig) -> Self {
        Self {
            lock: Mutex::new(()),
            refresh_count: AtomicU64::new(0),
            config,
        }
    }

    /// 刷新凭证
    ///
    /// # 参数
    /// * `cell` - 凭证单元
    /// * `observed_generation` - 触发 401 的请求所使用的凭证 generation
    /// * `handler` - 刷新回调
    ///
    /// # 返回
    /// 之后请求应使用的凭证；刷新失败时原凭证保持不变并返回刷新错误
    pub async fn refresh(
        &self,
        cell: &CredentialCell,
        observed_generation: u64,
        handler: &dyn RefreshHandler,
    ) -> CloudResult<Arc<Credential>> {
        let _guard = if self.config.single_flight {
            Some(self.lock.lock().await)
        } else {
            None
        };

        let (current, generation) = cell.snapshot();
        if generation != observed_generation {
            debug!(
                "凭证已被其他请求刷新，复用新凭证: generation {} -> {}",
                observed_generation, generation
            );
            return Ok(current);
        }

        info!("开始刷新凭证: principal={}", current.principal);
        self.refresh_count.fetch_add(1, Ordering::SeqCst);

        let renewed = match handler.refresh(&current).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!("凭证刷新失败，保留原凭证: {}", e);
                return Err(e);
            }
        };

        match cell.replace_if_current(observed_generation, renewed) {
            Ok((credential, generation)) => {
                info!("凭证刷新成功: generation={}", generation);
                Ok(credential)
            }
            Err((credential, generation)) => {
                warn!(
                    "刷新结果已过期（当前 generation={}），丢弃本次刷新结果",
                    generation
                );
                Ok(credential)
            }
        }
    }

    /// 实际调用刷新回调的次数
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::refresh_fn;
    use crate::error::CloudServiceError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_refresh_replaces_credential() {
        let cell = CredentialCell::new(Credential::new("alice", "old").with_refresh_token("r"));
        let coordinator = RefreshCoordinator::default();
        let handler = refresh_fn(|_| async { Ok(Credential::new("alice", "new")) });

        let credential = coordinator.refresh(&cell, 0, handler.as_ref()).await.unwrap();
        assert_eq!(credential.token, "new");
        assert_eq!(cell.credential().token, "new");
        assert_eq!(coordinator.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_credential() {
        let cell = CredentialCell::new(Credential::new("alice", "old"));
        let coordinator = RefreshCoordinator::default();
        let handler = refresh_fn(|_| async {
            Err(CloudServiceError::service(400, Some("invalid_grant".to_string())))
        });

        let err = coordinator
            .refresh(&cell, 0, handler.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(400));
        assert_eq!(cell.credential().token, "old");
        assert_eq!(cell.generation(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let cell = Arc::new(CredentialCell::new(Credential::new("alice", "old")));
        let coordinator = Arc::new(RefreshCoordinator::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_for_handler = Arc::clone(&calls);
        let handler = refresh_fn(move |_| {
            let calls = Arc::clone(&calls_for_handler);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Credential::new("alice", "new"))
            }
        });

        // 5 个请求都在 generation 0 遇到 401
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let cell = Arc::clone(&cell);
            let coordinator = Arc::clone(&coordinator);
            let handler = Arc::clone(&handler);
            tasks.push(tokio::spawn(async move {
                coordinator.refresh(&cell, 0, handler.as_ref()).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().token, "new");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cell.generation(), 1);
    }

    #[tokio::test]
    async fn test_newer_generation_reused_without_single_flight() {
        let cell = CredentialCell::new(Credential::new("alice", "old"));
        let coordinator = RefreshCoordinator::new(RefreshCoordinatorConfig {
            single_flight: false,
        });
        let handler = refresh_fn(|_| async { Ok(Credential::new("alice", "stale")) });
        // 另一个请求已先完成刷新
        cell.replace(Credential::new("alice", "newer"));

        // generation 已前进，直接复用 newer，刷新回调不会被调用
        let credential = coordinator.refresh(&cell, 0, handler.as_ref()).await.unwrap();
        assert_eq!(credential.token, "newer");
        assert_eq!(coordinator.refresh_count(), 0);
    }
}
