mod masking;
mod render;

pub use masking::MaskPolicy;
pub use render::{scrub_ips, MessageInput, MessageRenderer, MessageTemplates};

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    alerting::NotificationEvent,
    checks::USER_AGENT,
    config::TelegramConfig,
    metrics::{NOTIFICATIONS_FAILED_TOTAL, NOTIFICATIONS_SENT_TOTAL},
    Error, Result,
};

const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound delivery of an already rendered message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;
    async fn deliver(&self, text: &str) -> Result<()>;
}

/// Telegram bot channel.
pub struct TelegramNotifier {
    bot_token: String,
    chat_id: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(TELEGRAM_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            api_base: api_base.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn channel(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);

        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": true
        });

        // The URL carries the bot token; keep it out of errors and logs.
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Http(e.without_url()))?;

        if response.status().is_success() {
            debug!("Telegram message sent");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(Error::Internal(format!(
                "Telegram API returned {}: {}",
                status, body
            )))
        }
    }
}

/// Writes messages to the log. Used when no chat is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, text: &str) -> Result<()> {
        info!(target: "notifications", "{}", text);
        Ok(())
    }
}

pub fn build_notifier(config: &TelegramConfig) -> Result<Arc<dyn Notifier>> {
    match (&config.bot_token, &config.chat_id) {
        (Some(token), Some(chat_id)) => Ok(Arc::new(TelegramNotifier::new(
            token.clone(),
            chat_id.clone(),
            config.api_base.clone(),
        )?)),
        _ => Ok(Arc::new(LogNotifier)),
    }
}

/// Best-effort delivery of alert events. Failures are logged and counted,
/// never propagated: the alert transition is already committed.
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Returns whether the message was delivered.
    pub async fn dispatch(&self, event: &NotificationEvent) -> bool {
        let channel = self.notifier.channel();
        match self.notifier.deliver(&event.message).await {
            Ok(()) => {
                NOTIFICATIONS_SENT_TOTAL.with_label_values(&[channel]).inc();
                info!(
                    alert_id = %event.alert_id,
                    kind = %event.kind,
                    transition = ?event.transition,
                    channel,
                    "Notification delivered"
                );
                true
            }
            Err(e) => {
                NOTIFICATIONS_FAILED_TOTAL.with_label_values(&[channel]).inc();
                warn!(
                    alert_id = %event.alert_id,
                    kind = %event.kind,
                    channel,
                    error = %e,
                    "Notification delivery failed"
                );
                false
            }
        }
    }
}
