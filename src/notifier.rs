// =============================================================================
// Notifier — Telegram message and document dispatch
// =============================================================================
//
// Sends are best-effort: failures are logged and never surface to the
// caller's control flow. Each recipient is an independent send; partial
// success is reported per chat. Successful sends leave a categorized echo
// in the operator log, e.g. `Telegram[submit-success] sent`.
// =============================================================================

use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::TelegramSettings;

const API_BASE: &str = "https://api.telegram.org";

/// Telegram notifier for one market's recipient list.
pub struct Notifier {
    settings: TelegramSettings,
    client: reqwest::Client,
    /// Separate client with the longer file-upload deadline.
    upload_client: reqwest::Client,
}

impl Notifier {
    pub fn new(settings: TelegramSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        let upload_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            settings,
            client,
            upload_client,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.settings.is_configured()
    }

    fn url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.settings.bot_token)
    }

    /// Send `text` to every configured chat. `category` tags the log echo.
    pub async fn send_text(&self, category: &str, text: &str) {
        if !self.is_configured() {
            debug!(category, "telegram not configured — notification skipped");
            return;
        }

        let mut sent = 0usize;
        for chat_id in &self.settings.chat_ids {
            let body = serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            });

            match self.client.post(self.url("sendMessage")).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => sent += 1,
                Ok(resp) => {
                    warn!(category, chat_id = %chat_id, status = %resp.status(), "telegram send rejected")
                }
                Err(e) => warn!(category, chat_id = %chat_id, error = %e, "telegram send failed"),
            }
        }

        if sent > 0 {
            info!(
                recipients = sent,
                total = self.settings.chat_ids.len(),
                "Telegram[{category}] sent"
            );
        }
    }

    /// Send a file as a document attachment with `caption`.
    pub async fn send_document(&self, category: &str, path: &Path, caption: &str) {
        if !self.is_configured() {
            debug!(category, "telegram not configured — document skipped");
            return;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "report.xlsx".to_string());

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(category, file = %path.display(), error = %e, "document unreadable — not sent");
                return;
            }
        };

        let mut sent = 0usize;
        for chat_id in &self.settings.chat_ids {
            let part = reqwest::multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
            let form = reqwest::multipart::Form::new()
                .text("chat_id", chat_id.clone())
                .text("caption", caption.to_string())
                .text("parse_mode", "HTML")
                .part("document", part);

            match self
                .upload_client
                .post(self.url("sendDocument"))
                .multipart(form)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => sent += 1,
                Ok(resp) => {
                    warn!(category, chat_id = %chat_id, status = %resp.status(), "telegram document rejected")
                }
                Err(e) => warn!(category, chat_id = %chat_id, error = %e, "telegram document failed"),
            }
        }

        if sent > 0 {
            info!(
                recipients = sent,
                total = self.settings.chat_ids.len(),
                file = %file_name,
                "Telegram[{category}] sent"
            );
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("bot_token", &"<redacted>")
            .field("recipients", &self.settings.chat_ids.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn settings(token: &str, chats: &str) -> TelegramSettings {
        TelegramSettings {
            bot_token: token.to_string(),
            chat_ids: chats
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    #[test]
    fn configuration_requires_token_and_chats() {
        assert!(!Notifier::new(settings("", "1,2")).is_configured());
        assert!(!Notifier::new(settings("tok", "")).is_configured());
        assert!(Notifier::new(settings("tok", "1, 2")).is_configured());
    }

    #[tokio::test]
    async fn unconfigured_send_is_a_noop() {
        // Must not panic and must not attempt network traffic.
        let notifier = Notifier::new(settings("", ""));
        notifier.send_text("test", "hello").await;
        notifier
            .send_document("test", Path::new("/nonexistent/file.xlsx"), "cap")
            .await;
    }
}
