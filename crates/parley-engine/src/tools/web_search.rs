use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use parley_core::tools::{Tool, ToolContext, ToolError};

/// Queries a Brave-compatible web search endpoint.
pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(endpoint: impl Into<String>, api_key: Option<SecretString>, max_results: usize) -> Self {
        let client = super::http_client("web_search", Duration::from_secs(15), "Parley/1.0");
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            max_results: max_results.clamp(1, 20),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return the top results with title, URL and snippet"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "additionalProperties": false,
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "count": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 20,
                    "description": "Number of results"
                }
            }
        })
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = args["query"]
            .as_str()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("query must not be empty".into()))?;

        let api_key = self.api_key.as_ref().ok_or_else(|| {
            ToolError::InvocationFailed("web search is not configured: missing API key".into())
        })?;

        let count = args["count"]
            .as_u64()
            .map_or(self.max_results, |c| c as usize)
            .min(20);

        let response = self
            .client
            .get(&self.endpoint)
            .header("X-Subscription-Token", api_key.expose_secret())
            .header("Accept", "application/json")
            .query(&[("q", query), ("count", &count.to_string())])
            .send()
            .await
            .map_err(|e| ToolError::InvocationFailed(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::InvocationFailed(format!(
                "search failed: HTTP {status}: {body}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::InvocationFailed(format!("failed to parse response: {e}")))?;

        Ok(json!({
            "query": query,
            "results": extract_results(&body, count),
        }))
    }
}

fn extract_results(body: &Value, limit: usize) -> Vec<Value> {
    body["web"]["results"]
        .as_array()
        .map(|results| {
            results
                .iter()
                .take(limit)
                .map(|r| {
                    json!({
                        "title": r["title"].as_str().unwrap_or("(untitled)"),
                        "url": r["url"].as_str().unwrap_or(""),
                        "description": r["description"].as_str().unwrap_or(""),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
