//! 带过期时间的单值缓存，用于工具目录
//!
//! 失败结果不缓存；过期后下一次读取重新拉取。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::tools::analysis::{AnalysisClient, ToolSpec};

pub struct TimedCache<T> {
    ttl: Duration,
    slot: Mutex<Option<(Instant, T)>>,
}

impl<T: Clone> TimedCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// 命中且未过期时直接返回；否则调用 fetch，成功才写入
    pub async fn get_or_fetch<F, Fut, E>(&self, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some((stored_at, value)) = slot.as_ref() {
            if stored_at.elapsed() < self.ttl {
                return Ok(value.clone());
            }
        }
        let value = fetch().await?;
        *slot = Some((Instant::now(), value.clone()));
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

/// AnalysisClient 装饰器：list_tools 走 TimedCache，call_tool 直通
pub struct CachedCatalog {
    inner: Arc<dyn AnalysisClient>,
    catalog: TimedCache<Vec<ToolSpec>>,
}

impl CachedCatalog {
    pub fn new(inner: Arc<dyn AnalysisClient>, ttl: Duration) -> Self {
        Self {
            inner,
            catalog: TimedCache::new(ttl),
        }
    }
}

#[async_trait]
impl AnalysisClient for CachedCatalog {
    async fn call_tool(&self, name: &str, params: &Map<String, Value>) -> Result<Value, String> {
        self.inner.call_tool(name, params).await
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, String> {
        self.catalog.get_or_fetch(|| self.inner.list_tools()).await
    }
}
