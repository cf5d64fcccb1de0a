//! Small social network API: registration and login, posts with likes and
//! comments, and a follower graph, served over actix-web and backed by a
//! Redis document store.

pub mod auth;
pub mod comments;
pub mod config;
pub mod core;
pub mod follow;
pub mod models;
pub mod posts;
pub mod users;

use actix_web::{web, HttpResponse};

use crate::config::Config;
use crate::core::db::Store;
use crate::core::errors::{json_error_handler, ApiError};

/// Shared by every handler through `web::Data`.
pub struct AppState {
    pub store: Store,
    pub config: Config,
}

impl AppState {
    pub fn new(store: Store, config: Config) -> Self {
        Self { store, config }
    }

    pub fn in_memory(config: Config) -> Self {
        Self::new(Store::in_memory(), config)
    }
}

async fn index() -> HttpResponse {
    HttpResponse::Ok().body("Social Media API is running")
}

/// Registers every route. The app must also carry a `web::Data<AppState>`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .app_data(web::QueryConfig::default().error_handler(|err, _req| {
            tracing::debug!(error = %err, "rejected query string");
            ApiError::bad_request("Invalid query").into()
        }))
        .route("/", web::get().to(index))
        .service(
            web::scope("/api")
                .configure(auth::routes)
                .configure(users::routes)
                .configure(posts::routes)
                .configure(comments::routes),
        );
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::Config;
    use crate::models::models::{RegisterRequest, User};
    use crate::AppState;

    pub fn state() -> AppState {
        AppState::in_memory(Config::for_tests())
    }

    pub fn register(state: &AppState, username: &str) -> User {
        crate::auth::register(
            state,
            RegisterRequest {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                password: "secret123".to_string(),
                avatar: None,
            },
        )
        .unwrap()
    }
}
