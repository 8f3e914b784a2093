//! 检索能力：向文档检索服务查询与任务相关的参考资料
//!
//! POST {base_url}/query，body {"query", "top_k"}；响应 matches[].document 中的非空文本即为结果。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::RetrievalSection;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalQuery {
    pub query: String,
    pub top_k: usize,
}

impl RetrievalQuery {
    pub fn new(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            top_k,
        }
    }
}

#[async_trait]
pub trait RetrievalClient: Send + Sync {
    /// 返回匹配到的文档文本；错误以字符串描述
    async fn query(&self, query: &RetrievalQuery) -> Result<Vec<String>, String>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    #[serde(default)]
    document: Option<String>,
}

/// 检索服务 HTTP 客户端
pub struct HttpRetrievalClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRetrievalClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// 未配置 base_url 时返回 None
    pub fn from_config(section: &RetrievalSection) -> Option<Self> {
        section.base_url.as_ref().map(|url| {
            Self::new(url.clone(), section.api_key.clone(), section.timeout_secs)
        })
    }
}

#[async_trait]
impl RetrievalClient for HttpRetrievalClient {
    async fn query(&self, query: &RetrievalQuery) -> Result<Vec<String>, String> {
        if query.query.trim().is_empty() {
            return Err("Missing 'query' in payload".to_string());
        }

        let mut request = self
            .client
            .post(format!("{}/query", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(query);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| format!("RAG API call failed: {}", e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("API error: {}: {}", status.as_u16(), body));
        }

        let parsed: QueryResponse = resp
            .json()
            .await
            .map_err(|e| format!("RAG API returned malformed body: {}", e))?;
        Ok(extract_documents(parsed))
    }
}

fn extract_documents(response: QueryResponse) -> Vec<String> {
    response
        .matches
        .into_iter()
        .filter_map(|m| m.document)
        .filter(|doc| !doc.is_empty())
        .collect()
}
