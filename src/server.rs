//! HTTP surface: Twilio webhook, health and manual test endpoints.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::relay::handler::panic_message;
use crate::relay::twilio::{self, SIGNATURE_HEADER, WebhookForm};
use crate::relay::{Inference, MessageHandler, Messenger};

/// Empty TwiML document: acknowledges the webhook without a synchronous reply.
pub const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

const DEFAULT_TEST_USER: &str = "Test User";

/// Parameters for `X-Twilio-Signature` verification.
#[derive(Clone)]
pub struct SignatureCheck {
    /// Public URL Twilio posts to, exactly as configured in the console.
    pub url: String,
    pub auth_token: String,
}

impl SignatureCheck {
    /// Enabled only when a public webhook URL is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config.twilio_webhook_url.as_ref().map(|url| Self {
            url: url.clone(),
            auth_token: config.twilio_auth_token.clone(),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<MessageHandler>,
    pub messenger: Arc<dyn Messenger>,
    pub inference: Arc<dyn Inference>,
    pub signature: Option<SignatureCheck>,
}

impl AppState {
    pub fn new(messenger: Arc<dyn Messenger>, inference: Arc<dyn Inference>, signature: Option<SignatureCheck>) -> Self {
        let handler = Arc::new(MessageHandler::new(messenger.clone(), inference.clone()));
        Self {
            handler,
            messenger,
            inference,
            signature,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .route("/test/send", post(test_send))
        .route("/test/ai", post(test_ai))
        .fallback(not_found)
        .with_state(state)
}

async fn index() -> Json<Value> {
    Json(json!({
        "service": "WhatsApp AI Bot",
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "webhook": "/webhook (POST) - Twilio WhatsApp webhook",
            "health": "/health (GET) - Service health check",
            "test_send": "/test/send (POST) - Send a test message",
            "test_ai": "/test/ai (POST) - Test the AI model",
        },
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    match AssertUnwindSafe(state.handler.check_health()).catch_unwind().await {
        Ok(status) => Json(status).into_response(),
        Err(panic) => {
            let message = panic_message(&*panic);
            error!("Health check failed: {message}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "error", "message": message })),
            )
                .into_response()
        }
    }
}

fn twiml(body: &'static str) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

async fn webhook(State(state): State<AppState>, headers: HeaderMap, Form(form): Form<WebhookForm>) -> Response {
    info!("Webhook received");

    if let Some(check) = &state.signature {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !twilio::verify_signature(&check.auth_token, &check.url, &form, signature) {
            warn!("Rejected webhook with bad signature");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    if !twilio::validate_webhook(&form) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let Some(message) = twilio::parse_incoming_message(&form) else {
        return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
    };

    match AssertUnwindSafe(state.handler.process_message(&message))
        .catch_unwind()
        .await
    {
        Ok(true) => info!("Message from {} processed", message.from),
        Ok(false) => warn!("Message from {} was not answered", message.from),
        Err(panic) => error!("Webhook processing failed: {}", panic_message(&*panic)),
    }

    twiml(EMPTY_TWIML)
}

#[derive(Deserialize)]
struct TestSendRequest {
    to: Option<String>,
    message: Option<String>,
}

async fn test_send(State(state): State<AppState>, payload: Result<Json<TestSendRequest>, JsonRejection>) -> Response {
    let (to, message) = match payload {
        Ok(Json(TestSendRequest {
            to: Some(to),
            message: Some(message),
        })) if !to.is_empty() && !message.is_empty() => (to, message),
        Ok(_) => return bad_request("Missing 'to' or 'message' field"),
        Err(e) => {
            warn!("Bad test/send body: {e}");
            return bad_request("Missing request body");
        }
    };

    let to = twilio::whatsapp_address(&to);
    match state.messenger.send(&to, &message).await {
        Some(sid) => Json(json!({ "success": true, "message_sid": sid, "to": to })).into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "Failed to send message" })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct TestAiRequest {
    prompt: Option<String>,
    user_name: Option<String>,
}

async fn test_ai(State(state): State<AppState>, payload: Result<Json<TestAiRequest>, JsonRejection>) -> Response {
    let (prompt, user_name) = match payload {
        Ok(Json(TestAiRequest {
            prompt: Some(prompt),
            user_name,
        })) if !prompt.is_empty() => (prompt, user_name.unwrap_or_else(|| DEFAULT_TEST_USER.to_string())),
        Ok(_) => return bad_request("Missing 'prompt' field"),
        Err(e) => {
            warn!("Bad test/ai body: {e}");
            return bad_request("Missing request body");
        }
    };

    let response = state.inference.generate(&prompt, &user_name).await;
    Json(json!({ "success": true, "prompt": prompt, "response": response })).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Route not found", "status": 404 })),
    )
        .into_response()
}
