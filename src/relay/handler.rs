//! Message handler - turns one inbound message into exactly one reply.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::relay::huggingface::ModelStatus;
use crate::relay::message::InboundMessage;
use crate::relay::replies;
use crate::relay::twilio::{AccountInfo, TwilioError};

/// Outbound side of the messaging provider.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a text reply. Returns the provider message id on success.
    async fn send(&self, to: &str, body: &str) -> Option<String>;

    async fn account_info(&self) -> Result<AccountInfo, TwilioError>;
}

/// Text generation backend.
#[async_trait]
pub trait Inference: Send + Sync {
    /// Always returns a usable reply, falling back to a fixed apology.
    async fn generate(&self, prompt: &str, user_name: &str) -> String;

    async fn model_status(&self) -> ModelStatus;

    fn model(&self) -> &str;
}

/// Built-in slash commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Info,
    Ping,
}

impl Command {
    /// Case-insensitive, ignores surrounding whitespace.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "/start" | "/aide" | "/help" => Some(Command::Help),
            "/info" => Some(Command::Info),
            "/ping" => Some(Command::Ping),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    fn is_ok(&self) -> bool {
        self.status == ServiceState::Ok
    }

    fn failed(error: String) -> Self {
        error!("Health probe failed: {error}");
        Self {
            status: ServiceState::Error,
            info: None,
            error: Some(error),
        }
    }
}

/// Aggregate health of the upstream services.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: OverallStatus,
    pub services: BTreeMap<&'static str, ServiceHealth>,
}

pub struct MessageHandler {
    messenger: Arc<dyn Messenger>,
    inference: Arc<dyn Inference>,
}

impl MessageHandler {
    pub fn new(messenger: Arc<dyn Messenger>, inference: Arc<dyn Inference>) -> Self {
        info!("Message handler ready");
        Self { messenger, inference }
    }

    /// Compute and send the reply for `message`.
    ///
    /// Returns true iff the reply was accepted by the provider. A panic while
    /// building or sending the reply is contained here: the sender gets one
    /// apology attempt and the call reports failure.
    pub async fn process_message(&self, message: &InboundMessage) -> bool {
        let sender = message.from.as_str();
        if sender.is_empty() {
            error!("Message has no sender, dropping");
            return false;
        }

        let reply_and_send = async {
            let reply = self.build_reply(message).await;
            self.messenger.send(sender, &reply).await
        };

        match AssertUnwindSafe(reply_and_send).catch_unwind().await {
            Ok(Some(_)) => {
                info!("Reply sent to {sender}");
                true
            }
            Ok(None) => {
                error!("Failed to send reply to {sender}");
                false
            }
            Err(panic) => {
                error!("Error while processing message: {}", panic_message(&*panic));
                let apology = AssertUnwindSafe(self.messenger.send(sender, replies::APOLOGY_TEXT));
                if apology.catch_unwind().await.is_err() {
                    error!("Apology to {sender} failed as well");
                }
                false
            }
        }
    }

    /// Reply text for `message`: media acknowledgment, command, generated text
    /// or the empty-message prompt.
    pub async fn build_reply(&self, message: &InboundMessage) -> String {
        let body = message.body.trim();

        if message.num_media > 0 {
            info!("Message with {} media item(s)", message.num_media);
            replies::media_acknowledgment(message)
        } else if !body.is_empty() {
            self.text_reply(body, &message.profile_name).await
        } else {
            replies::EMPTY_TEXT.to_string()
        }
    }

    async fn text_reply(&self, text: &str, user_name: &str) -> String {
        let preview: String = text.chars().take(100).collect();
        info!("Text message: {preview}");

        match Command::parse(text) {
            Some(Command::Help) => replies::HELP_TEXT.to_string(),
            Some(Command::Info) => replies::info_text(self.inference.model()),
            Some(Command::Ping) => replies::PONG_TEXT.to_string(),
            None => self.inference.generate(text, user_name).await,
        }
    }

    /// Probe both upstream services. A failure or panic in one probe is
    /// recorded under that service and does not stop the other.
    pub async fn check_health(&self) -> HealthStatus {
        let (account, model) = tokio::join!(
            AssertUnwindSafe(self.messenger.account_info()).catch_unwind(),
            AssertUnwindSafe(self.inference.model_status()).catch_unwind(),
        );

        let twilio = match account {
            Ok(Ok(info)) => ServiceHealth {
                status: ServiceState::Ok,
                info: serde_json::to_value(info).ok(),
                error: None,
            },
            Ok(Err(e)) => ServiceHealth::failed(e.to_string()),
            Err(panic) => ServiceHealth::failed(panic_message(&*panic)),
        };

        let huggingface = match model {
            Ok(model) => ServiceHealth {
                status: if model.available { ServiceState::Ok } else { ServiceState::Error },
                error: (!model.available).then(|| model.message.clone()),
                info: serde_json::to_value(&model).ok(),
            },
            Err(panic) => ServiceHealth::failed(panic_message(&*panic)),
        };

        let status = if twilio.is_ok() && huggingface.is_ok() {
            OverallStatus::Healthy
        } else {
            OverallStatus::Degraded
        };

        HealthStatus {
            status,
            services: BTreeMap::from([("twilio", twilio), ("huggingface", huggingface)]),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
