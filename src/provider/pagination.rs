// 分页列表
//
// 把"按续页令牌取一页"的函数转成惰性的页流，服务端不再返回令牌时结束

use crate::error::CloudResult;
use futures::{Stream, TryStreamExt};
use std::collections::HashSet;
use std::future::Future;
use tracing::warn;

/// 一页结果
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 下一页令牌（marker / cursor / offset / pageToken）
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next: Option<String>) -> Self {
        Self { items, next }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// 惰性分页流
///
/// 每次重新调用都会从第一页开始；令牌为空字符串，或与本次已用过的任一令牌重复，都视为结束
pub fn paginate<T, F, Fut>(fetch: F) -> impl Stream<Item = CloudResult<Vec<T>>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = CloudResult<Page<T>>>,
{
    let state = (fetch, Cursor::Start, HashSet::<String>::new());
    futures::stream::try_unfold(state, |(mut fetch, cursor, mut seen)| async move {
        let token = match cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
            Cursor::Done => return Ok(None),
        };
        if let Some(token) = &token {
            seen.insert(token.clone());
        }
        let page = fetch(token).await?;
        let next = match page.next {
            Some(next) if next.is_empty() => Cursor::Done,
            Some(next) if seen.contains(&next) => {
                warn!("分页令牌重复出现，停止翻页: {}", next);
                Cursor::Done
            }
            Some(next) => Cursor::Next(next),
            None => Cursor::Done,
        };
        Ok(Some((page.items, (fetch, next, seen))))
    })
}

/// 取完所有页
pub async fn collect_all<T, F, Fut>(fetch: F) -> CloudResult<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = CloudResult<Page<T>>>,
{
    paginate(fetch).try_concat().await
}
