use crate::api_client::REQUEST_TIMEOUT;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Client for the auxiliary query-optimized index. Notifications are
/// best-effort: fired off the write path, never awaited by the user
/// flow, never retried, failures logged only.
pub struct IndexNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl IndexNotifier {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Fires a cache-invalidation notification on a detached task.
    pub fn notify_detached(self: &Arc<Self>, qci: u64, operation: &'static str) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(qci, operation).await {
                warn!(qci, operation, error = %e, "index invalidation notification failed");
            }
        });
    }

    async fn notify(&self, qci: u64, operation: &'static str) -> Result<(), reqwest::Error> {
        self.client
            .post(format!(
                "{}/cache/invalidate",
                self.base_url.trim_end_matches('/')
            ))
            .json(&json!({ "qci": qci, "operation": operation }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        debug!(qci, operation, "index notified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_posts_entity_and_operation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/cache/invalidate")
            .match_body(mockito::Matcher::Json(
                json!({ "qci": 7, "operation": "create" }),
            ))
            .with_status(200)
            .create_async()
            .await;

        let notifier = IndexNotifier::new(server.url());
        notifier.notify(7, "create").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failures_are_swallowed_by_the_detached_path() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/cache/invalidate")
            .with_status(500)
            .create_async()
            .await;

        let notifier = Arc::new(IndexNotifier::new(server.url()));
        // Must not panic or surface anything; the task just logs.
        notifier.notify_detached(7, "update");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}
