mod agi;
mod anthropic_types;
mod call_session;
mod config;
mod db_types;
mod deepgram_types;
mod error;
mod extraction;
mod gemini_types;
mod google_tts_types;
mod handlers;
mod inference;
mod notify;
mod openai_types;
mod phone;
mod profile;
mod speech;
mod store;
mod tasks;
#[cfg(test)]
mod testing;
mod turn_io;
mod types;
mod utils;

use crate::config::Config;
use crate::error::handle_error;
use crate::inference::InferenceChain;
use crate::notify::NotificationDispatcher;
use crate::store::BookingStore;
use crate::types::AppState;

use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

pub mod consts {
    pub const FALLBACK_REPLY: &str = "Es tut mir leid, es gibt gerade ein technisches Problem. \
        Bitte versuchen Sie es später erneut oder hinterlassen Sie Ihren Namen und Ihre Telefonnummer.";
    pub const APOLOGY_REPLY: &str =
        "Entschuldigung, ich habe Sie nicht verstanden. Könnten Sie das bitte wiederholen?";
    pub const REPROMPT: &str = "Hallo? Sind Sie noch dran? Wie kann ich Ihnen helfen?";
    pub const FAREWELL_REPLY: &str = "Auf Wiederhören! Ich wünsche Ihnen einen schönen Tag.";
    pub const CALLER_FAREWELL_PHRASES: &[&str] = &[
        "tschüss",
        "auf wiedersehen",
        "bye",
        "wiederhören",
        "das war's",
        "das wars",
        "ich leg auf",
        "ich lege auf",
    ];
    pub const ASSISTANT_FAREWELL_PHRASES: &[&str] = &[
        "auf wiederhören",
        "auf wiederhoeren",
        "einen schönen tag",
        "schoenen tag",
    ];
}

#[tokio::main]
async fn main() {
    // a missing .env is fine in production
    let _ = dotenvy::dotenv();
    let config = Config::from_env().expect("invalid configuration");

    let level = LevelFilter::from_str(&config.log_level).unwrap_or(LevelFilter::INFO);
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", LevelFilter::OFF),
            ("sqlx", LevelFilter::WARN),
            ("phone_assistant_rs", level),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let http_client = reqwest::Client::new();
    let store = BookingStore::connect(&config.database_url, config.phone.clone())
        .await
        .expect("cannot open booking database");
    let chain = Arc::new(InferenceChain::from_settings(
        &config.providers,
        &config.call,
        &http_client,
    ));
    let transcriber = speech::transcriber_from_settings(&config.stt, &http_client);
    let synthesizer = speech::synthesizer_from_settings(&config.tts, &http_client);
    let dispatcher = Arc::new(
        NotificationDispatcher::from_settings(&config.notify, &http_client)
            .expect("invalid notification settings"),
    );
    tokio::fs::create_dir_all(&config.audio_dir)
        .await
        .expect("cannot create audio directory");

    let bind_addr = config.bind_addr;
    let agi_bind_addr = config.agi_bind_addr;
    info!(
        business = %config.active_business,
        providers = config.providers.len(),
        "starting phone assistant"
    );
    let app_state = Arc::new(AppState {
        config,
        store,
        chain,
        transcriber,
        synthesizer,
        dispatcher,
    });

    let app = handlers::api_router(app_state.clone());
    let agi_listener = TcpListener::bind(agi_bind_addr)
        .await
        .expect("cannot bind FastAGI port");

    tokio::select! {
        res = axum::Server::bind(&bind_addr).serve(app.into_make_service()) => {
            if let Err(e) = res {
                handle_error(e).await;
            }
        }
        res = agi::serve(agi_listener, app_state) => {
            if let Err(e) = res {
                handle_error(e).await;
            }
        }
    }
}
