//! 分析能力：结构化的交易分析、风险检查、报告生成等工具服务
//!
//! HTTP 模式：POST {base_url}/tools/{name} 调用工具，GET {base_url}/tools 列出工具目录；
//! 未接入真实服务时使用 MockAnalysisClient 返回固定样例数据。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// 工具目录中的一项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParam>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[async_trait]
pub trait AnalysisClient: Send + Sync {
    async fn call_tool(&self, name: &str, params: &Map<String, Value>) -> Result<Value, String>;

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, String>;
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    tools: Vec<ToolSpec>,
}

/// 分析服务 HTTP 客户端
pub struct HttpAnalysisClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAnalysisClient {
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

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl AnalysisClient for HttpAnalysisClient {
    async fn call_tool(&self, name: &str, params: &Map<String, Value>) -> Result<Value, String> {
        let request = self
            .client
            .post(format!("{}/tools/{}", self.base_url, name))
            .json(params);
        let resp = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| format!("MCP API call failed: {}", e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("API error: {}: {}", status.as_u16(), body));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| format!("MCP API returned malformed body: {}", e))
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, String> {
        let request = self.client.get(format!("{}/tools", self.base_url));
        let resp = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| format!("MCP API call failed: {}", e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("API error: {}: {}", status.as_u16(), body));
        }
        let catalog: CatalogResponse = resp
            .json()
            .await
            .map_err(|e| format!("MCP API returned malformed catalog: {}", e))?;
        Ok(catalog.tools)
    }
}

/// 内置样例数据，用于演示与测试
#[derive(Debug, Default, Clone, Copy)]
pub struct MockAnalysisClient;

impl MockAnalysisClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AnalysisClient for MockAnalysisClient {
    async fn call_tool(&self, name: &str, params: &Map<String, Value>) -> Result<Value, String> {
        match name {
            "transaction_analyzer" => Ok(json!({
                "total_transactions": 20,
                "high_value_transactions": 5,
                "suspicious_patterns": [
                    { "pattern": "circular_transfer", "confidence": 0.85, "transactions": ["0x123", "0x456"] },
                    { "pattern": "layering", "confidence": 0.72, "transactions": ["0x789", "0xabc"] }
                ],
                "average_amount": 15000,
                "largest_amount": 50000
            })),
            "fetch_transaction" => Ok(json!({
                "transactions": [
                    { "id": "1", "amount": 1000, "sender": "0x123", "receiver": "0x456" },
                    { "id": "2", "amount": 2000, "sender": "0x789", "receiver": "0xabc" },
                    { "id": "3", "amount": 3000, "sender": "0xdef", "receiver": "0xghi" },
                    { "id": "4", "amount": 4000, "sender": "0xjkl", "receiver": "0xmnop" },
                    { "id": "5", "amount": 5000, "sender": "0xqrst", "receiver": "0xuvwxyz" }
                ]
            })),
            "risk_checker" => Ok(json!({
                "risk_level": "medium",
                "risk_factors": [
                    { "factor": "mixer_interaction", "score": 65 },
                    { "factor": "high_value_transfers", "score": 40 }
                ],
                "known_entities": [
                    { "address": "0xdef", "category": "exchange", "name": "Exchange X" },
                    { "address": "0xghi", "category": "mixer", "name": "Mixer Y" }
                ],
                "overall_score": 58
            })),
            "report_generator" => {
                let mut report = json!({
                    "summary": "The address shows moderate risk patterns with some suspicious transactions.",
                    "risk_assessment": "Medium risk due to mixer interactions and high-value transfers.",
                    "recommendations": [
                        "Monitor for additional suspicious patterns",
                        "Investigate connections to known mixer addresses"
                    ]
                });
                let include_evidence = params
                    .get("include_evidence")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if include_evidence {
                    report["evidence"] = json!([
                        {
                            "type": "transaction",
                            "description": "Large transfer to known mixer",
                            "data": { "tx_hash": "0x123", "amount": 25000 }
                        },
                        {
                            "type": "pattern",
                            "description": "Circular transaction pattern detected",
                            "data": { "addresses": ["0xabc", "0xdef", "0xghi"] }
                        }
                    ]);
                }
                Ok(report)
            }
            other => Err(format!("Tool '{}' not supported in mock mode", other)),
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, String> {
        Ok(vec![ToolSpec {
            name: "fetch_transaction".to_string(),
            description: "Fetch transaction data from the blockchain.".to_string(),
            parameters: vec![ToolParam {
                name: "limit".to_string(),
                kind: "int".to_string(),
            }],
        }])
    }
}
