use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use whatsapp_relay::config::Config;
use whatsapp_relay::logging;
use whatsapp_relay::relay::{HuggingFaceClient, TwilioClient};
use whatsapp_relay::server::{self, AppState, SignatureCheck};

#[tokio::main]
async fn main() {
    let env_file = Path::new(".env");
    let config = match Config::load(env_file.exists().then_some(env_file)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            eprintln!("Set the required variables in the environment or in .env");
            std::process::exit(1);
        }
    };

    // Keep the guard alive or buffered file logs are lost
    let _log_guard = match logging::init(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging at {}: {e}", config.log_file.display());
            std::process::exit(1);
        }
    };

    info!("🚀 Starting WhatsApp AI bot");
    info!("Model: {}", config.huggingface_model);
    info!("Listening on {}:{}", config.host, config.port);
    info!("Debug mode: {}", config.debug);
    if config.twilio_webhook_url.is_none() {
        info!("TWILIO_WEBHOOK_URL not set, webhook signatures are not checked");
    }

    let messenger = Arc::new(TwilioClient::from_config(&config));
    let inference = Arc::new(HuggingFaceClient::from_config(&config));
    let state = AppState::new(messenger, inference, SignatureCheck::from_config(&config));
    let app = server::build_router(state);

    let listener = match tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}:{}: {e}", config.host, config.port);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
