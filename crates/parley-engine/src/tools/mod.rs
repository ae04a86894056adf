pub mod analyze_code;
pub mod generate_image;
pub mod query_history;
pub mod storage;
pub mod web_search;

use std::sync::Arc;
use std::time::Duration;

use parley_settings::{EngineSettings, ToolSettings};
use tracing::{error, warn};

use crate::registry::ToolRegistry;

/// Create a ToolRegistry with all built-in tools. Tools whose credentials
/// are missing are still registered and fail when invoked.
pub fn create_default_registry(tools: &ToolSettings, engine: &EngineSettings) -> ToolRegistry {
    let mut registry = ToolRegistry::new()
        .with_timeout(engine.tool_timeout())
        .with_max_output_bytes(engine.max_tool_output_bytes);

    // Web
    registry.register(Arc::new(web_search::WebSearchTool::new(
        &tools.search_url,
        tools.search_api_key(),
        tools.search_max_results,
    )));
    registry.register(Arc::new(generate_image::GenerateImageTool::new(
        &tools.image_url,
        tools.image_api_key(),
        &tools.image_model,
    )));

    // Local
    registry.register(Arc::new(analyze_code::AnalyzeCodeTool));

    // Stores
    registry.register(Arc::new(storage::StorageTool));
    registry.register(Arc::new(query_history::QueryHistoryTool));

    registry
}

/// HTTP client for an outbound tool. A rejected user agent is logged and
/// dropped; the timeout is kept either way.
pub(crate) fn http_client(tool: &str, timeout: Duration, user_agent: &str) -> reqwest::Client {
    match reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(tool, error = %e, "http client rejected, building without user agent");
            reqwest::Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
                error!(tool, error = %e, "http client rejected, using defaults without timeout");
                reqwest::Client::new()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtins_without_credentials() {
        let registry = create_default_registry(&ToolSettings::default(), &EngineSettings::default());
        assert_eq!(
            registry.names(),
            vec!["analyze_code", "generate_image", "query_history", "storage", "web_search"]
        );
        assert_eq!(registry.timeout(), EngineSettings::default().tool_timeout());
    }

    #[tokio::test]
    async fn rejected_user_agent_keeps_timeout() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let client = http_client("test", Duration::from_millis(200), "bad\nagent");
        let err = client.get(server.uri()).send().await.unwrap_err();
        assert!(err.is_timeout());
    }
}
