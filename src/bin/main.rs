use std::io;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use socialite::config::Config;
use socialite::core::db::{init_test_data, Store};
use socialite::AppState;

fn cors(config: &Config) -> Cors {
    let cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "DELETE"])
        .allow_any_header()
        .max_age(3600);

    match &config.cors_origin {
        Some(origin) => cors.allowed_origin(origin),
        None => cors.allow_any_origin(),
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,socialite=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load();

    let store = Store::open(&config.database_url).map_err(|e| {
        tracing::error!(error = ?e, "failed to open document store");
        io::Error::new(io::ErrorKind::Other, e.to_string())
    })?;

    if config.seed_demo_data {
        if let Err(e) = init_test_data(&store) {
            tracing::warn!(error = ?e, "failed to seed demo data");
        }
    }

    let port = config.port;
    let state = web::Data::new(AppState::new(store, config));

    tracing::info!("Server listening on http://0.0.0.0:{port}");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(cors(&state.config))
            .wrap(TracingLogger::default())
            .configure(socialite::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
