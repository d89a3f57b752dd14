//! Usage: Fire-and-forget operator alerts posted to the error-report endpoint.

use serde::Serialize;
use std::time::Duration;

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub service: String,
    pub endpoint: String,
    pub error: String,
}

#[derive(Clone)]
pub struct ErrorReporter {
    client: reqwest::Client,
    url: Option<String>,
    service: &'static str,
}

impl ErrorReporter {
    pub fn new(client: reqwest::Client, url: Option<String>, service: &'static str) -> Self {
        let url = url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
        if url.is_none() {
            tracing::warn!("error report url not configured, alerts will only be logged");
        }
        Self {
            client,
            url,
            service,
        }
    }

    pub fn report(&self, endpoint: &str, error: impl Into<String>) {
        let report = ErrorReport {
            service: self.service.to_string(),
            endpoint: endpoint.to_string(),
            error: error.into(),
        };
        tracing::error!(endpoint = %report.endpoint, error = %report.error, "reporting error");

        let Some(url) = self.url.clone() else {
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = send(&client, &url, &report).await {
                tracing::warn!("error report delivery failed: {err}");
            }
        });
    }

    /// Awaitable variant used where the caller is already off the hot path.
    pub async fn report_now(&self, endpoint: &str, error: impl Into<String>) {
        let report = ErrorReport {
            service: self.service.to_string(),
            endpoint: endpoint.to_string(),
            error: error.into(),
        };
        tracing::error!(endpoint = %report.endpoint, error = %report.error, "reporting error");
        let Some(url) = self.url.as_deref() else {
            return;
        };
        if let Err(err) = send(&self.client, url, &report).await {
            tracing::warn!("error report delivery failed: {err}");
        }
    }
}

async fn send(
    client: &reqwest::Client,
    url: &str,
    report: &ErrorReport,
) -> Result<(), reqwest::Error> {
    client
        .post(url)
        .timeout(REPORT_TIMEOUT)
        .json(report)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
