use actix_web::{web, HttpResponse};

use crate::auth::AuthUser;
use crate::config::*;
use crate::core::db::Transaction;
use crate::core::errors::ApiError;
use crate::core::helpers::run_blocking;
use crate::models::models::{Message, User};
use crate::AppState;

fn load_pair(
    tx: &mut Transaction<'_>,
    target_username: &str,
    requester_id: &str,
) -> Result<(User, User), ApiError> {
    let not_found = || ApiError::not_found("User not found");

    let target_id: String = tx.get_json(&username_key(target_username))?.ok_or_else(not_found)?;
    let target: User = tx.get_json(&user_key(&target_id))?.ok_or_else(not_found)?;
    let requester: User = tx
        .get_json(&user_key(requester_id))?
        .ok_or(ApiError::Unauthorized)?;

    Ok((target, requester))
}

/// Adds `requester_id` to the target's followers and the target to the
/// requester's following, in one transaction.
pub fn follow_user(state: &AppState, target_username: &str, requester_id: &str) -> Result<(), ApiError> {
    state.store.transaction(|tx| {
        let (mut target, mut requester) = load_pair(tx, target_username, requester_id)?;

        if target.id == requester.id {
            return Err(ApiError::bad_request("Cannot follow yourself"));
        }
        if target.followers.iter().any(|id| id == requester_id) {
            return Err(ApiError::bad_request("Already following"));
        }

        target.followers.push(requester.id.clone());
        if !requester.following.contains(&target.id) {
            requester.following.push(target.id.clone());
        }

        tx.set_json(&user_key(&target.id), &target)?;
        tx.set_json(&user_key(&requester.id), &requester)?;

        tracing::info!(follower = %requester.id, followee = %target.id, "followed user");
        Ok(())
    })
}

/// Removes the relationship from both sides. Succeeds whether or not it
/// existed.
pub fn unfollow_user(state: &AppState, target_username: &str, requester_id: &str) -> Result<(), ApiError> {
    state.store.transaction(|tx| {
        let (mut target, mut requester) = load_pair(tx, target_username, requester_id)?;

        if target.id == requester.id {
            return Ok(());
        }

        let before = (target.followers.len(), requester.following.len());
        target.followers.retain(|id| id != &requester.id);
        requester.following.retain(|id| id != &target.id);

        if before != (target.followers.len(), requester.following.len()) {
            tx.set_json(&user_key(&target.id), &target)?;
            tx.set_json(&user_key(&requester.id), &requester)?;
            tracing::info!(follower = %requester.id, followee = %target.id, "unfollowed user");
        }
        Ok(())
    })
}

// === HTTP Handlers ===

pub async fn handle_follow(
    state: web::Data<AppState>,
    AuthUser(user): AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let username = path.into_inner();
    run_blocking(move || follow_user(&state, &username, &user.id)).await?;
    Ok(HttpResponse::Ok().json(Message::new("Followed user")))
}

pub async fn handle_unfollow(
    state: web::Data<AppState>,
    AuthUser(user): AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let username = path.into_inner();
    run_blocking(move || unfollow_user(&state, &username, &user.id)).await?;
    Ok(HttpResponse::Ok().json(Message::new("Unfollowed user")))
}
