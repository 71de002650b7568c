// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! One-way operator alerts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::warn;
use url::Url;

use crate::security::sealed::{ADMIN_ID, TELEGRAM_TOKEN};
use crate::security::SealedSettings;

pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notifier not configured: {0} missing")]
    NotConfigured(&'static str),
    #[error("alert request failed: {0}")]
    Request(String),
    #[error("alert endpoint returned HTTP {0}")]
    Status(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
}

/// Sends alerts to the operator chat through the Telegram Bot API.
///
/// The bot token and chat id are opened from sealed settings per message.
pub struct TelegramNotifier {
    base_url: Url,
    settings: Arc<SealedSettings>,
    http: Client,
}

impl TelegramNotifier {
    pub fn new(base_url: &str, settings: Arc<SealedSettings>) -> Result<Self, NotifyError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| NotifyError::Request(format!("invalid alert base URL: {e}")))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            settings,
            http,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let chat_id = self
            .settings
            .open(ADMIN_ID)
            .ok_or(NotifyError::NotConfigured(ADMIN_ID))?;

        let request = {
            let token = self
                .settings
                .open(TELEGRAM_TOKEN)
                .ok_or(NotifyError::NotConfigured(TELEGRAM_TOKEN))?;
            let mut url = self.base_url.clone();
            url.path_segments_mut()
                .map_err(|()| NotifyError::Request("alert base URL cannot have a path".into()))?
                .pop_if_empty()
                .push(&format!("bot{}", token.as_str()))
                .push("sendMessage");
            self.http.post(url).json(&SendMessage {
                chat_id: chat_id.as_str(),
                text: format!("Bot alert:\n\n{message}"),
            })
        };

        // The URL carries the bot token; keep it out of error messages.
        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.without_url().to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Writes alerts to the log when no chat is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        warn!(target: "alert", message = %message, "Operator alert");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::vault::{SecretVault, MASTER_ENCRYPTION};
    use crate::security::CipherService;

    fn settings() -> Arc<SealedSettings> {
        let vault = Arc::new(SecretVault::new());
        vault.store(MASTER_ENCRYPTION, vec![9u8; 32]);
        Arc::new(SealedSettings::new(CipherService::new(vault)))
    }

    #[tokio::test]
    async fn missing_chat_is_not_configured() {
        let notifier = TelegramNotifier::new(DEFAULT_TELEGRAM_API_URL, settings()).unwrap();
        assert!(matches!(
            notifier.notify("hello").await,
            Err(NotifyError::NotConfigured(ADMIN_ID))
        ));
    }

    #[tokio::test]
    async fn missing_token_is_not_configured() {
        let settings = settings();
        settings.seal(ADMIN_ID, "42").unwrap();
        let notifier = TelegramNotifier::new(DEFAULT_TELEGRAM_API_URL, settings).unwrap();
        assert!(matches!(
            notifier.notify("hello").await,
            Err(NotifyError::NotConfigured(TELEGRAM_TOKEN))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_does_not_leak_token() {
        let settings = settings();
        settings.seal(ADMIN_ID, "42").unwrap();
        settings.seal(TELEGRAM_TOKEN, "123:secret-token").unwrap();
        let notifier = TelegramNotifier::new("http://127.0.0.1:9", settings).unwrap();

        let err = notifier.notify("hello").await.unwrap_err();
        assert!(matches!(err, NotifyError::Request(_)));
        assert!(!err.to_string().contains("secret-token"));
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        assert!(LogNotifier.notify("disk full").await.is_ok());
    }
}
