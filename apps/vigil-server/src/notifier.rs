use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use vigil_page::ChangeType;

/// What a message is about; cooldown and diagnostic events are flagged so
/// the chat layer can render them differently from change alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Change,
    Cooldown,
    Diagnostic,
}

/// Outbound message handed to the chat layer. Delivery is at-least-once;
/// de-duplication is the receiver's concern.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_type: Option<ChangeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_final: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_diff: Option<String>,
    pub text: String,
}

impl Notification {
    pub fn change(
        url: String,
        change_type: ChangeType,
        similarity_final: f64,
        safe_diff: Option<String>,
    ) -> Self {
        let text = format!(
            "Change detected on {url}: {} (similarity {:.0}%)",
            change_type.as_str(),
            similarity_final * 100.0
        );
        Self {
            kind: NotificationKind::Change,
            url,
            change_type: Some(change_type),
            similarity_final: Some(similarity_final),
            safe_diff,
            text,
        }
    }

    pub fn cooldown(url: String, host: &str) -> Self {
        Self {
            kind: NotificationKind::Cooldown,
            url,
            change_type: None,
            similarity_final: None,
            safe_diff: None,
            text: format!(
                "{host} is failing repeatedly; checks are paused for an hour. \
                 Consider snoozing or removing the monitor if this persists."
            ),
        }
    }

    pub fn diagnostic(url: String, detail: String) -> Self {
        Self {
            kind: NotificationKind::Diagnostic,
            url,
            change_type: None,
            similarity_final: None,
            safe_diff: None,
            text: detail,
        }
    }
}

/// Outbound seam to the chat layer. The engine drains at most 25 msg/s into
/// this; the implementation is expected to stay under its own external cap.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, chat_id: &str, message: &Notification);
}

/// Boundary stub used when no chat front-end is wired in: renders every
/// delivery as a structured log line.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, chat_id: &str, message: &Notification) {
        info!(
            target: "notifier",
            chat_id,
            kind = ?message.kind,
            url = %message.url,
            "{}",
            message.text
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Collects deliveries for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub delivered: Mutex<Vec<(String, Notification)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn deliver(&self, chat_id: &str, message: &Notification) {
            self.delivered
                .lock()
                .unwrap()
                .push((chat_id.to_string(), message.clone()));
        }
    }
}
