//! Telegram Bot API client for offline alerts.
//!
//! The bot only knows chats that have messaged it, so delivery works by
//! scanning recent updates for a chat whose username matches the stored
//! handle, then posting to that chat id. Best-effort: every failure is
//! logged by the worker and swallowed.

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use super::Notification;
use crate::config::TelegramConfig;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("telegram request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram api rejected the call")]
    Api,
    #[error("no telegram chat matches the handle")]
    UnknownHandle,
}

/// Subset of the getUpdates response needed to map handles to chat ids.
#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    chat: Chat,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    username: Option<String>,
}

pub struct TelegramNotifier {
    client: Client,
    token: String,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            client: Client::new(),
            token: config.bot_token,
            api_base: config.api_base,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Deliver one alert: resolve the recipient's chat id from recent bot
    /// updates, then post the message.
    pub async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let updates: UpdatesResponse = self
            .client
            .post(self.api_url("getUpdates"))
            .send()
            .await?
            .json()
            .await?;

        if !updates.ok {
            return Err(NotifyError::Api);
        }

        let chat_id = resolve_chat_id(&updates.result, &notification.handle)
            .ok_or(NotifyError::UnknownHandle)?;

        let text = format!(
            "{} sent you a message:\n{}",
            notification.sender_name, notification.text
        );

        self.client
            .post(self.api_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await?
            .error_for_status()?;

        tracing::info!(handle = %notification.handle, "telegram notification sent");
        Ok(())
    }
}

/// A stored handle ("https://t.me/name" or "@name") matches the chat whose
/// username it ends with.
fn resolve_chat_id(updates: &[Update], handle: &str) -> Option<i64> {
    updates.iter().find_map(|update| {
        let chat = &update.message.as_ref()?.chat;
        let username = chat.username.as_deref()?;
        handle.ends_with(username).then_some(chat.id)
    })
}
