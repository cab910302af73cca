use async_trait::async_trait;
use log::{ info, warn };
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::sync::Arc;

use crate::error::CapabilityError;

/// Outbound escalation channel (email gateway, paging webhook, ...).
/// Callers log failures and never propagate them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String]
    ) -> Result<(), CapabilityError>;
}

/// Writes escalations to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String]
    ) -> Result<(), CapabilityError> {
        warn!("ESCALATION to {:?}: {}\n{}", recipients, subject, body);
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
    recipients: &'a [String],
}

/// Posts escalations as JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    http: HttpClient,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout_ms: u64) -> Result<Self, CapabilityError> {
        Ok(Self {
            http: crate::llm::http_client(timeout_ms)?,
            url,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String]
    ) -> Result<(), CapabilityError> {
        self.http
            .post(&self.url)
            .json(&(WebhookPayload { subject, body, recipients }))
            .send().await?
            .error_for_status()?;
        info!("Escalation posted to webhook for {} recipient(s)", recipients.len());
        Ok(())
    }
}

pub fn create_notifier(
    kind: &str,
    webhook_url: Option<&str>,
    timeout_ms: u64
) -> Result<Arc<dyn Notifier>, CapabilityError> {
    match (kind.to_lowercase().as_str(), webhook_url) {
        ("webhook", Some(url)) => Ok(Arc::new(WebhookNotifier::new(url.to_string(), timeout_ms)?)),
        ("webhook", None) =>
            Err(CapabilityError::NotConfigured("NOTIFIER=webhook requires NOTIFY_WEBHOOK_URL".into())),
        ("log", _) => Ok(Arc::new(LogNotifier)),
        (other, _) => Err(CapabilityError::NotConfigured(format!("Unsupported notifier: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let res = LogNotifier.notify("s", "b", &["ops@example.com".to_string()]).await;
        assert!(res.is_ok());
    }

    #[test]
    fn webhook_needs_url() {
        assert!(create_notifier("webhook", None, 1000).is_err());
        assert!(create_notifier("webhook", Some("http://localhost:9/hook"), 1000).is_ok());
        assert!(create_notifier("pager", None, 1000).is_err());
    }
}
