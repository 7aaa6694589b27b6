//! Relay module - forwards WhatsApp messages to a Hugging Face model and replies.

pub mod handler;
pub mod huggingface;
pub mod message;
pub mod replies;
pub mod twilio;


pub use handler::{HealthStatus, Inference, MessageHandler, Messenger};
pub use huggingface::{HuggingFaceClient, ModelStatus, RetryPolicy};
pub use message::{InboundMessage, MediaItem, MediaKind};
pub use twilio::{AccountInfo, TwilioClient, TwilioError, WebhookForm};
