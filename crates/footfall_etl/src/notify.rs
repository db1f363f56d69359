//! Tell the query service to drop its cached results after a run.

use std::time::Duration;
use tracing::{info, warn};

pub const CLEAR_CACHE_PATH: &str = "/admin/clear-cache";
pub const TOKEN_HEADER: &str = "X-Internal-Token";
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// POST the admin clear-cache hook. Never fails; problems are logged.
pub async fn clear_query_cache(host: &str, port: u16, token: Option<&str>) -> bool {
    let Some(token) = token else {
        warn!("INTERNAL_API_TOKEN is not set; skipping query cache clear");
        return false;
    };

    let url = format!("http://{}:{}{}", host, port, CLEAR_CACHE_PATH);
    let client = match reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            warn!("Cannot build HTTP client for cache clear: {}", e);
            return false;
        }
    };

    match client.post(&url).header(TOKEN_HEADER, token).send().await {
        Ok(resp) if resp.status().is_success() => {
            info!("Query service cache cleared via {}", url);
            true
        }
        Ok(resp) => {
            warn!("Cache clear at {} returned {}", url, resp.status());
            false
        }
        Err(e) => {
            warn!("Cache clear at {} failed: {}", url, e);
            false
        }
    }
}
