//! Best-effort delivery of terminal run results

use serde::Serialize;
use specwright_common::RunStatus;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CallbackConfig;
use crate::report::RunReport;

/// Body POSTed to a run's callback URL
#[derive(Debug, Serialize)]
pub struct CallbackPayload<'a> {
    pub run_id: &'a str,
    pub status: RunStatus,
    pub result: Option<&'a RunReport>,
    pub error: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct CallbackClient {
    client: reqwest::Client,
}

impl CallbackClient {
    pub fn new(config: &CallbackConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_s.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("specwright/{}", specwright_common::VERSION))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    /// POST the payload; any transport error or non-2xx status is returned
    pub async fn deliver(&self, url: &str, payload: &CallbackPayload<'_>) -> Result<(), reqwest::Error> {
        let response = self.client.post(url).json(payload).send().await?;
        response.error_for_status()?;
        debug!(run_id = payload.run_id, url, "Callback delivered");
        Ok(())
    }
}
