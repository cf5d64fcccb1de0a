use std::collections::HashSet;

use actix_web::web;
use ammonia::Builder;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use html_escape::decode_html_entities;
use rand::rngs::OsRng;
use uuid::Uuid;

use crate::core::errors::ApiError;

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

pub fn validate_uuid(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

/// Strips every HTML tag, leaving plain text. The cleaner escapes what it
/// keeps, so entities are decoded again: `Tom & Jerry` comes back unchanged.
pub fn sanitize_text(text: &str) -> String {
    let cleaned = Builder::default().tags(HashSet::new()).clean(text).to_string();
    decode_html_entities(&cleaned).into_owned()
}

/// Runs blocking work (store round trips, password hashing) on actix's
/// blocking thread pool.
pub async fn run_blocking<F, R>(f: F) -> Result<R, ApiError>
where
    F: FnOnce() -> Result<R, ApiError> + Send + 'static,
    R: Send + 'static,
{
    web::block(f)
        .await
        .map_err(|e| anyhow::anyhow!("blocking task failed: {}", e))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let hash = hash_password("hunter22").unwrap();
        assert_ne!(hash, "hunter22");
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn sanitize_strips_markup() {
        assert_eq!(sanitize_text("<b>hi</b> there"), "hi there");
        assert_eq!(sanitize_text("<script>alert(1)</script>ok"), "ok");
    }

    #[test]
    fn sanitize_keeps_plain_text_verbatim() {
        assert_eq!(sanitize_text("Tom & Jerry"), "Tom & Jerry");
        assert_eq!(sanitize_text("Tom & Jerry say 1 < 2"), "Tom & Jerry say 1 < 2");
        assert_eq!(sanitize_text("\"quoted\" it's"), "\"quoted\" it's");
    }

    #[actix_web::test]
    async fn blocking_work_propagates_errors() {
        assert_eq!(run_blocking(|| Ok(2 + 2)).await.unwrap(), 4);
        let failed: Result<(), ApiError> = run_blocking(|| Err(ApiError::Forbidden)).await;
        assert!(matches!(failed, Err(ApiError::Forbidden)));
    }

    #[test]
    fn uuid_validation() {
        assert!(validate_uuid(&new_id()));
        assert!(!validate_uuid("123"));
    }
}
