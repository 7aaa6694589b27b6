//! WhatsApp relay: receives Twilio WhatsApp webhooks, answers with a
//! Hugging Face hosted model and replies through the Twilio API.

pub mod config;
pub mod logging;
pub mod relay;
pub mod server;
