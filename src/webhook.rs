//! Best-effort webhook error sink.
//!
//! When a `webhook_url` is configured, task failures are POSTed to it as
//! JSON. Delivery is fire-and-forget on a spawned task with a short
//! timeout; failures are logged at warn and never affect the worker loop.

use std::time::Duration;

use serde_json::json;
use tracing::warn;

use crate::task::Task;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure notifier bound to one webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    /// Creates a sink for the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// The configured webhook URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Posts a failure notification for `task`, without waiting for the
    /// outcome.
    pub fn notify_failure(&self, task: &Task) {
        let payload = json!({
            "task_id": task.task_id,
            "task_name": task.task_name,
            "error": task.error.as_ref().map(|e| e.message.clone()),
            "finished_at": task.finished_at,
        });

        let url = self.url.clone();
        let client = self.client.clone();
        let task_id = task.task_id.clone();

        tokio::spawn(async move {
            let sent = client
                .post(&url)
                .timeout(WEBHOOK_TIMEOUT)
                .json(&payload)
                .send()
                .await;

            match sent {
                Ok(response) if !response.status().is_success() => {
                    warn!(
                        task_id = %task_id,
                        status = %response.status(),
                        "Webhook rejected failure notification"
                    );
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Webhook delivery failed");
                }
                Ok(_) => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_keeps_url() {
        let sink = WebhookSink::new("https://ops.example/hook");
        assert_eq!(sink.url(), "https://ops.example/hook");
    }
}
