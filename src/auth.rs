use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest, HttpResponse};
use anyhow::{anyhow, Context};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use regex::Regex;

use crate::config::*;
use crate::core::errors::ApiError;
use crate::core::helpers::{
    hash_password, new_id, now_iso, run_blocking, sanitize_text, verify_password,
};
use crate::models::models::{
    Claims, LoginRequest, LoginResponse, PublicUser, RegisterRequest, User,
};
use crate::AppState;

const MAX_TOKEN_HOURS: i64 = 24 * 365;

// === Tokens ===

pub fn issue_token(config: &Config, user: &User) -> anyhow::Result<String> {
    let now = Utc::now();
    let hours = config.token_expiration_hours.clamp(1, MAX_TOKEN_HOURS);
    let claims = Claims {
        sub: user.id.clone(),
        username: user.username.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(hours)).timestamp(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .context("signing token")
}

/// Checks signature and expiry.
pub fn verify_token(config: &Config, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// === Auth gate ===

/// The authenticated caller. Taking this as a handler argument makes the
/// route protected: the request is rejected with 401 unless it carries a valid
/// bearer token whose subject still exists.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let checked = check_token(req);

        Box::pin(async move {
            let (state, claims) = checked?;
            run_blocking(move || load_subject(&state, &claims)).await
        })
    }
}

/// Signature and expiry, without touching the store.
fn check_token(req: &HttpRequest) -> Result<(web::Data<AppState>, Claims), ApiError> {
    let state = req
        .app_data::<web::Data<AppState>>()
        .cloned()
        .ok_or_else(|| anyhow!("application state not registered"))?;

    let token = bearer_token(req).ok_or(ApiError::Unauthorized)?;

    let claims = verify_token(&state.config, token).map_err(|e| {
        tracing::debug!(error = %e, "rejected bearer token");
        ApiError::Unauthorized
    })?;

    Ok((state, claims))
}

fn load_subject(state: &AppState, claims: &Claims) -> Result<AuthUser, ApiError> {
    let user = state
        .store
        .get_json::<User>(&user_key(&claims.sub))?
        .ok_or_else(|| {
            tracing::debug!(user_id = %claims.sub, "token subject no longer exists");
            ApiError::Unauthorized
        })?;

    Ok(AuthUser(user))
}

// === Registration and login ===

fn username_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("Regex should compile"))
}

fn email_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("Regex should compile"))
}

pub fn register(state: &AppState, req: RegisterRequest) -> Result<User, ApiError> {
    let username = req.username.trim();
    let email = req.email.trim().to_lowercase();

    if username.len() < MIN_USERNAME_LENGTH || username.len() > MAX_USERNAME_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Username must be {}-{} characters",
            MIN_USERNAME_LENGTH, MAX_USERNAME_LENGTH
        )));
    }
    if !username_regex().is_match(username) {
        return Err(ApiError::bad_request(
            "Username may only contain letters, digits, '_', '.' and '-'",
        ));
    }
    if !email_regex().is_match(&email) {
        return Err(ApiError::bad_request("Invalid email"));
    }
    if req.password.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }

    // Hashing is slow; keep it outside the transaction.
    let password = hash_password(&req.password)?;
    let avatar = req
        .avatar
        .map(|a| sanitize_text(a.trim()))
        .filter(|a| !a.is_empty());

    state.store.transaction(|tx| {
        if tx.exists(&username_key(username))? || tx.exists(&email_key(&email))? {
            return Err(ApiError::bad_request("User already exists"));
        }

        let user = User {
            id: new_id(),
            username: username.to_string(),
            email: email.clone(),
            password: password.clone(),
            avatar: avatar.clone(),
            followers: Vec::new(),
            following: Vec::new(),
            created_at: now_iso(),
        };

        let mut users = tx.get_list(USERS_LIST_KEY)?;
        users.push(user.id.clone());

        tx.set_json(&user_key(&user.id), &user)?;
        tx.set_json(&username_key(&user.username), &user.id)?;
        tx.set_json(&email_key(&user.email), &user.id)?;
        tx.set_json(USERS_LIST_KEY, &users)?;

        tracing::info!(user_id = %user.id, username = %user.username, "registered user");
        Ok(user)
    })
}

pub fn login(state: &AppState, req: LoginRequest) -> Result<LoginResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("Email and password are required"));
    }

    let user = state
        .store
        .get_json::<String>(&email_key(&email))?
        .map(|id| state.store.get_json::<User>(&user_key(&id)))
        .transpose()?
        .flatten();

    match user {
        Some(user) if verify_password(&req.password, &user.password) => {
            let token = issue_token(&state.config, &user)?;
            tracing::info!(user_id = %user.id, "user logged in");
            Ok(LoginResponse {
                user: PublicUser::from(&user),
                token,
            })
        }
        _ => {
            tracing::debug!(email = %email, "login rejected");
            Err(ApiError::Unauthorized)
        }
    }
}

// === HTTP Handlers ===

pub async fn register_user(
    state: web::Data<AppState>,
    body: web::Json<RegisterRequest>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    let user = run_blocking(move || register(&state, body)).await?;
    Ok(HttpResponse::Created().json(PublicUser::from(&user)))
}

pub async fn login_user(
    state: web::Data<AppState>,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    let resp = run_blocking(move || login(&state, body)).await?;
    Ok(HttpResponse::Ok().json(resp))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/auth")
            .route("/register", web::post().to(register_user))
            .route("/login", web::post().to(login_user)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::in_memory(Config::for_tests())
    }

    fn register_req(username: &str, email: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: "secret123".to_string(),
            avatar: None,
        }
    }

    #[test]
    fn token_round_trip() {
        let state = state();
        let user = register(&state, register_req("alice", "alice@example.com")).unwrap();
        let token = issue_token(&state.config, &user).unwrap();
        let claims = verify_token(&state.config, &token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.username, "alice");
    }

    #[test]
    fn token_with_other_secret_is_rejected() {
        let state = state();
        let user = register(&state, register_req("alice", "alice@example.com")).unwrap();
        let token = issue_token(&state.config, &user).unwrap();

        let mut other = Config::for_tests();
        other.jwt_secret = "another-secret".to_string();
        assert!(verify_token(&other, &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let config = Config::for_tests();
        let past = Utc::now() - Duration::hours(3);
        let claims = Claims {
            sub: new_id(),
            username: "ghost".to_string(),
            iat: past.timestamp(),
            exp: (past + Duration::hours(1)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap();
        assert!(verify_token(&config, &token).is_err());
    }

    #[test]
    fn register_rejects_duplicates() {
        let state = state();
        register(&state, register_req("alice", "alice@example.com")).unwrap();

        let same_name = register(&state, register_req("alice", "other@example.com"));
        assert!(matches!(same_name, Err(ApiError::BadRequest(_))));

        let same_email = register(&state, register_req("alice2", "ALICE@example.com"));
        assert!(matches!(same_email, Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn register_validates_input() {
        let state = state();
        for (username, email) in [("ab", "ab@example.com"), ("bad name", "x@example.com"), ("carol", "nope")] {
            let result = register(&state, register_req(username, email));
            assert!(matches!(result, Err(ApiError::BadRequest(_))), "{username} / {email}");
        }

        let mut short = register_req("carol", "carol@example.com");
        short.password = "123".to_string();
        assert!(matches!(register(&state, short), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn login_checks_password() {
        let state = state();
        register(&state, register_req("alice", "alice@example.com")).unwrap();

        let ok = login(
            &state,
            LoginRequest {
                email: "Alice@Example.com".to_string(),
                password: "secret123".to_string(),
            },
        )
        .unwrap();
        assert_eq!(ok.user.username, "alice");
        assert!(!ok.token.is_empty());

        let bad = login(
            &state,
            LoginRequest {
                email: "alice@example.com".to_string(),
                password: "wrong-password".to_string(),
            },
        );
        assert!(matches!(bad, Err(ApiError::Unauthorized)));

        let unknown = login(
            &state,
            LoginRequest {
                email: "nobody@example.com".to_string(),
                password: "secret123".to_string(),
            },
        );
        assert!(matches!(unknown, Err(ApiError::Unauthorized)));
    }
}
