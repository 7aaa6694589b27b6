//! Fixed reply texts.

use crate::relay::message::{InboundMessage, MediaKind};

pub const HELP_TEXT: &str = "🤖 *WhatsApp AI Bot*

I'm an assistant powered by Hugging Face. Ask me anything and I'll do my best to help!

*Available commands:*
• /help - Show this message
• /info - About the bot
• /ping - Check the bot is alive

Just send your message and I'll reply! 💬";

pub const PONG_TEXT: &str = "🏓 Pong! The bot is up.";

pub const EMPTY_TEXT: &str = "Sorry, I didn't receive any content. Send me a message! 💬";

pub const APOLOGY_TEXT: &str = "Sorry, something went wrong while processing your message. \
Please try again. 🙏";

const MEDIA_DISCLAIMER: &str = "\n\nI can currently only process text messages. \
Send me a question and I'll answer! 💬";

/// About text naming the model by its short name (`org/name` → `name`).
pub fn info_text(model: &str) -> String {
    let short_name = model.rsplit('/').next().unwrap_or_default();
    format!(
        "ℹ️ *About this bot*

• AI model: {short_name}
• Platform: Hugging Face Inference API
• WhatsApp service: Twilio
• Version: {}

The bot uses language models to understand and answer your messages naturally.",
        env!("CARGO_PKG_VERSION")
    )
}

fn media_sentence(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "I received your image. ",
        MediaKind::Audio => "I received your audio. ",
        MediaKind::Video => "I received your video. ",
        MediaKind::Document => "I received your document. ",
    }
}

/// Acknowledge attachments, one sentence per detected kind.
pub fn media_acknowledgment(message: &InboundMessage) -> String {
    let mut reply = if message.num_media > 1 {
        String::from("Thanks for the media! 📎\n\n")
    } else {
        String::from("Thanks for the attachment! 📎\n\n")
    };

    for kind in MediaKind::ALL {
        if message.has_media_kind(kind) {
            reply.push_str(media_sentence(kind));
        }
    }

    reply.push_str(MEDIA_DISCLAIMER);
    reply
}
