use std::{env, fmt::Display, str::FromStr};

use rand::{distributions::Alphanumeric, Rng};
use tracing::{info, warn};

// === Validation limits ===
pub const MIN_USERNAME_LENGTH: usize = 3;
pub const MAX_USERNAME_LENGTH: usize = 30;
pub const MIN_PASSWORD_LENGTH: usize = 6;
pub const MAX_POST_LENGTH: usize = 5000;
pub const MAX_COMMENT_LENGTH: usize = 1000;
pub const POSTS_PER_PAGE: usize = 20;

// === Store keys ===
pub const USERS_LIST_KEY: &str = "users_list";
pub const FEED_KEY: &str = "feed";

pub fn user_key(id: &str) -> String {
    format!("user:{}", id)
}

pub fn post_key(id: &str) -> String {
    format!("post:{}", id)
}

pub fn comment_key(id: &str) -> String {
    format!("comment:{}", id)
}

pub fn username_key(username: &str) -> String {
    format!("username:{}", username)
}

pub fn email_key(email: &str) -> String {
    format!("email:{}", email.to_lowercase())
}

/// Process configuration, read once at startup and shared through `web::Data`.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// `redis://host[:port][/db]`, or `memory://` for a throwaway store.
    pub database_url: String,
    pub jwt_secret: String,
    pub token_expiration_hours: i64,
    /// Unset means any origin is accepted.
    pub cors_origin: Option<String>,
    pub seed_demo_data: bool,
}

impl Config {
    pub fn load() -> Self {
        dotenv::dotenv().ok();

        Self {
            port: try_load("PORT", 5000),
            database_url: try_load("DATABASE_URL", "redis://127.0.0.1:6379/".to_string()),
            jwt_secret: jwt_secret(),
            token_expiration_hours: try_load("TOKEN_EXPIRATION_HOURS", 24),
            cors_origin: var("CORS_ORIGIN").ok().filter(|o| !o.is_empty()),
            seed_demo_data: try_load("SEED_DEMO_DATA", false),
        }
    }

    /// Configuration for tests and embedded use: in-memory store, fixed secret.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            database_url: "memory://".to_string(),
            jwt_secret: "test-secret".to_string(),
            token_expiration_hours: 24,
            cors_origin: None,
            seed_demo_data: false,
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        info!("Environment variable {key} not set");
    })
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Ok(raw) = var(key) else {
        info!("{key} using default: {default}");
        return default;
    };

    raw.parse().unwrap_or_else(|e| {
        warn!("Invalid {key} value {raw:?}: {e}, using default: {default}");
        default
    })
}

fn jwt_secret() -> String {
    match env::var("JWT_SECRET") {
        Ok(secret) if !secret.is_empty() => secret,
        _ => {
            warn!("JWT_SECRET not set; generating a per-process secret, tokens will not survive a restart");
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(48)
                .map(char::from)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(user_key("abc"), "user:abc");
        assert_eq!(post_key("abc"), "post:abc");
        assert_eq!(comment_key("abc"), "comment:abc");
        assert_eq!(email_key("Alice@Example.com"), "email:alice@example.com");
    }

    #[test]
    fn invalid_value_falls_back_to_default() {
        env::set_var("SOCIALITE_TEST_PORT", "not-a-port");
        let port: u16 = try_load("SOCIALITE_TEST_PORT", 5000);
        assert_eq!(port, 5000);
        env::remove_var("SOCIALITE_TEST_PORT");
    }
}
