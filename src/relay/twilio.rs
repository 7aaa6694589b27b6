//! Twilio WhatsApp client: webhook validation, parsing and outbound sends.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::relay::handler::Messenger;
use crate::relay::message::{InboundMessage, MediaItem};

/// Raw webhook form fields, sorted by key.
pub type WebhookForm = BTreeMap<String, String>;

/// Address prefix Twilio uses for WhatsApp numbers.
pub const WHATSAPP_PREFIX: &str = "whatsapp:";

/// Header carrying Twilio's request signature.
pub const SIGNATURE_HEADER: &str = "x-twilio-signature";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug)]
pub enum TwilioError {
    Http(String),
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },
    Parse(String),
    NotConfigured(&'static str),
    InvalidPayload(String),
}

impl std::fmt::Display for TwilioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TwilioError::Http(e) => write!(f, "HTTP error: {e}"),
            TwilioError::Api { status, code: Some(code), message } => {
                write!(f, "Twilio error {code} ({status}): {message}")
            }
            TwilioError::Api { status, code: None, message } => {
                write!(f, "Twilio error ({status}): {message}")
            }
            TwilioError::Parse(e) => write!(f, "Parse error: {e}"),
            TwilioError::NotConfigured(what) => write!(f, "{what} is not configured"),
            TwilioError::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
        }
    }
}

impl std::error::Error for TwilioError {}

/// Account metadata returned by the accounts resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub sid: String,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "type", default)]
    pub account_type: String,
}

#[derive(Deserialize)]
struct CreatedMessage {
    sid: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: Option<i64>,
    message: Option<String>,
}

pub struct TwilioClient {
    account_sid: String,
    auth_token: String,
    from_number: String,
    api_base: String,
    http: reqwest::Client,
}

impl TwilioClient {
    pub fn new(account_sid: String, auth_token: String, from_number: String, api_base: String) -> Self {
        Self {
            account_sid,
            auth_token,
            from_number: whatsapp_address(&from_number),
            api_base: api_base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.twilio_account_sid.clone(),
            config.twilio_auth_token.clone(),
            config.twilio_whatsapp_number.clone(),
            config.twilio_api_base.clone(),
        )
    }

    /// Send a text message. Returns the message SID, or `None` on any failure.
    pub async fn send_message(&self, to: &str, body: &str) -> Option<String> {
        let preview: String = body.chars().take(50).collect();
        info!("Sending message to {}: {}...", whatsapp_address(to), preview);

        match self.create_message(to, body, None).await {
            Ok(sid) => {
                info!("Message sent. SID: {sid}");
                Some(sid)
            }
            Err(e) => {
                error!("Failed to send message: {e}");
                None
            }
        }
    }

    /// Send a message with one media attachment.
    pub async fn send_media_message(&self, to: &str, body: &str, media_url: &str) -> Option<String> {
        info!("Sending media message to {}", whatsapp_address(to));

        match self.create_message(to, body, Some(media_url)).await {
            Ok(sid) => {
                info!("Media message sent. SID: {sid}");
                Some(sid)
            }
            Err(e) => {
                error!("Failed to send media message: {e}");
                None
            }
        }
    }

    /// Account metadata, or `None` if the account SID is unset or the lookup fails.
    pub async fn get_account_info(&self) -> Option<AccountInfo> {
        match self.fetch_account_info().await {
            Ok(info) => Some(info),
            Err(e) => {
                error!("Failed to fetch account info: {e}");
                None
            }
        }
    }

    pub async fn fetch_account_info(&self) -> Result<AccountInfo, TwilioError> {
        if self.account_sid.is_empty() {
            return Err(TwilioError::NotConfigured("TWILIO_ACCOUNT_SID"));
        }

        let url = format!(
            "{}/2010-04-01/Accounts/{}.json",
            self.api_base,
            urlencoding::encode(&self.account_sid)
        );

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| TwilioError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }

        response
            .json()
            .await
            .map_err(|e| TwilioError::Parse(e.to_string()))
    }

    async fn create_message(
        &self,
        to: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<String, TwilioError> {
        let to = whatsapp_address(to);
        let mut form = vec![
            ("From", self.from_number.as_str()),
            ("To", to.as_str()),
            ("Body", body),
        ];
        if let Some(media_url) = media_url {
            form.push(("MediaUrl", media_url));
        }

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base,
            urlencoding::encode(&self.account_sid)
        );

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .timeout(REQUEST_TIMEOUT)
            .form(&form)
            .send()
            .await
            .map_err(|e| TwilioError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }

        let created: CreatedMessage = response
            .json()
            .await
            .map_err(|e| TwilioError::Parse(e.to_string()))?;
        Ok(created.sid)
    }
}

#[async_trait]
impl Messenger for TwilioClient {
    async fn send(&self, to: &str, body: &str) -> Option<String> {
        self.send_message(to, body).await
    }

    async fn account_info(&self) -> Result<AccountInfo, TwilioError> {
        self.fetch_account_info().await
    }
}

fn api_error(status: u16, body: &str) -> TwilioError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => TwilioError::Api {
            status,
            code: parsed.code,
            message: parsed.message.unwrap_or_else(|| body.to_string()),
        },
        Err(_) => TwilioError::Api {
            status,
            code: None,
            message: body.to_string(),
        },
    }
}

/// Prefix `number` with `whatsapp:` unless it already has it.
pub fn whatsapp_address(number: &str) -> String {
    if number.starts_with(WHATSAPP_PREFIX) {
        number.to_string()
    } else {
        format!("{WHATSAPP_PREFIX}{number}")
    }
}

/// Field-level webhook check: `From` and `Body` present, `From` is a WhatsApp address.
///
/// This does not prove the request came from Twilio; see [`verify_signature`].
pub fn validate_webhook(form: &WebhookForm) -> bool {
    if !form.contains_key("From") || !form.contains_key("Body") {
        warn!("Invalid webhook: missing From or Body");
        return false;
    }

    let from = form.get("From").map(String::as_str).unwrap_or_default();
    if !from.starts_with(WHATSAPP_PREFIX) {
        warn!("Invalid webhook sender: {from}");
        return false;
    }

    true
}

/// Parse a webhook into an [`InboundMessage`]. Logs and returns `None` on malformed input.
pub fn parse_incoming_message(form: &WebhookForm) -> Option<InboundMessage> {
    match try_parse(form) {
        Ok(msg) => {
            info!("📨 Message from {} ({})", msg.profile_name, msg.from);
            let preview: String = msg.body.chars().take(100).collect();
            debug!("Content: {preview}");
            Some(msg)
        }
        Err(e) => {
            error!("Failed to parse webhook: {e}");
            None
        }
    }
}

fn try_parse(form: &WebhookForm) -> Result<InboundMessage, TwilioError> {
    let field = |key: &str| form.get(key).cloned().unwrap_or_default();

    let num_media = match form.get("NumMedia").map(|v| v.trim()) {
        None | Some("") => 0,
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| TwilioError::InvalidPayload(format!("NumMedia is not a count: '{raw}'")))?,
    };

    let media = (0..num_media)
        .map(|i| MediaItem {
            content_type: field(&format!("MediaContentType{i}")),
            url: field(&format!("MediaUrl{i}")),
        })
        .collect();

    Ok(InboundMessage {
        from: field("From"),
        to: field("To"),
        body: field("Body"),
        profile_name: form
            .get("ProfileName")
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string()),
        num_media,
        media,
        message_sid: field("MessageSid"),
        account_sid: field("AccountSid"),
    })
}

/// Compute the `X-Twilio-Signature` value for a form POST to `url`.
pub fn compute_signature(auth_token: &str, url: &str, params: &WebhookForm) -> Option<String> {
    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes()).ok()?;
    mac.update(url.as_bytes());
    for (key, value) in params {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }
    Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Check a request signature against the one we compute from the auth token.
pub fn verify_signature(auth_token: &str, url: &str, params: &WebhookForm, signature: &str) -> bool {
    match compute_signature(auth_token, url, params) {
        Some(expected) => constant_time_eq(&expected, signature),
        None => {
            warn!("failed to create HMAC");
            false
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}
