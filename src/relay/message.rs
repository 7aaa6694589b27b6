//! Normalized inbound message parsed from a webhook payload.

/// One attachment declared by the webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub content_type: String,
    pub url: String,
}

impl MediaItem {
    /// Substring match on the MIME type, e.g. `image/jpeg` is an `Image`.
    pub fn is(&self, kind: MediaKind) -> bool {
        self.content_type.contains(kind.as_str())
    }
}

/// Media families the bot acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

impl MediaKind {
    /// Acknowledgment order.
    pub const ALL: [MediaKind; 4] = [Self::Image, Self::Audio, Self::Video, Self::Document];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
        }
    }
}

/// A WhatsApp message as received from Twilio.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Sender address, e.g. `whatsapp:+33612345678`.
    pub from: String,
    pub to: String,
    pub body: String,
    pub profile_name: String,
    pub num_media: usize,
    pub media: Vec<MediaItem>,
    pub message_sid: String,
    pub account_sid: String,
}

impl InboundMessage {
    /// True if any attachment's content type matches `kind`.
    pub fn has_media_kind(&self, kind: MediaKind) -> bool {
        self.media.iter().any(|m| m.is(kind))
    }
}
