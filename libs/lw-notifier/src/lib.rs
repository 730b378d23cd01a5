//! Best-effort chat webhook alerting. `notify` never raises: a failed
//! post is logged and swallowed, matching the rest of this core's
//! convention that notification is a side channel, never a dependency of
//! the pipeline's own correctness (spec §4.12).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
}

#[derive(Serialize)]
struct NotifyPayload<'a> {
    title: &'a str,
    body: &'a str,
    severity: Severity,
}

impl Notifier {
    pub fn new(http: reqwest::Client, webhook_url: Option<String>) -> Self {
        Self { http, webhook_url }
    }

    pub async fn notify(&self, title: &str, body: &str, severity: Severity) {
        let Some(url) = self.webhook_url.as_deref() else {
            tracing::warn!(title, severity = ?severity, "NOTIFIER_WEBHOOK_URL not configured, logging alert instead: {body}");
            return;
        };
        let payload = NotifyPayload { title, body, severity };
        if let Err(err) = self.http.post(url).json(&payload).send().await {
            tracing::warn!(error = %err, title, "notifier webhook post failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_without_webhook_url_does_not_panic() {
        let notifier = Notifier::new(reqwest::Client::new(), None);
        notifier.notify("title", "body", Severity::Critical).await;
    }

    #[tokio::test]
    async fn notify_against_unreachable_url_swallows_the_error() {
        let notifier = Notifier::new(reqwest::Client::new(), Some("http://127.0.0.1:1".to_string()));
        notifier.notify("title", "body", Severity::Warning).await;
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
    }
}
