use actix_web::{web, HttpResponse};

use crate::auth::AuthUser;
use crate::config::*;
use crate::core::errors::ApiError;
use crate::core::helpers::{new_id, now_iso, run_blocking};
use crate::models::models::{Comment, Message, NewComment, Post};
use crate::posts::{clean_content, resolve_comment};
use crate::AppState;

/// Creates the comment and appends its id to the post in one transaction.
pub fn create_comment(
    state: &AppState,
    post_id: &str,
    user_id: &str,
    req: NewComment,
) -> Result<Comment, ApiError> {
    let content = clean_content(&req.content, MAX_COMMENT_LENGTH)?;

    state.store.transaction(|tx| {
        let key = post_key(post_id);
        let mut post: Post = tx
            .get_json(&key)?
            .ok_or_else(|| ApiError::not_found("Post not found"))?;

        let comment = Comment {
            id: new_id(),
            user_id: user_id.to_string(),
            post_id: post.id.clone(),
            content: content.clone(),
            created_at: now_iso(),
        };
        post.comments.push(comment.id.clone());

        tx.set_json(&comment_key(&comment.id), &comment)?;
        tx.set_json(&key, &post)?;

        tracing::info!(comment_id = %comment.id, post_id = %post.id, "created comment");
        Ok(comment)
    })
}

/// Owner-only. Deletes the comment and pulls its id from the parent post.
pub fn delete_comment(state: &AppState, comment_id: &str, user_id: &str) -> Result<(), ApiError> {
    state.store.transaction(|tx| {
        let key = comment_key(comment_id);
        let comment: Comment = tx
            .get_json(&key)?
            .ok_or_else(|| ApiError::not_found("Comment not found"))?;

        if comment.user_id != user_id {
            return Err(ApiError::Forbidden);
        }

        tx.delete(&key);

        let parent_key = post_key(&comment.post_id);
        if let Some(mut post) = tx.get_json::<Post>(&parent_key)? {
            post.comments.retain(|id| id != comment_id);
            tx.set_json(&parent_key, &post)?;
        }

        tracing::info!(comment_id = %comment_id, post_id = %comment.post_id, "deleted comment");
        Ok(())
    })
}

// === HTTP Handlers ===

pub async fn handle_create(
    state: web::Data<AppState>,
    AuthUser(user): AuthUser,
    path: web::Path<String>,
    body: web::Json<NewComment>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    let body = body.into_inner();
    let view = run_blocking(move || {
        let comment = create_comment(&state, &post_id, &user.id, body)?;
        Ok(resolve_comment(&state.store, comment)?)
    })
    .await?;
    Ok(HttpResponse::Created().json(view))
}

pub async fn handle_delete(
    state: web::Data<AppState>,
    AuthUser(user): AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let comment_id = path.into_inner();
    run_blocking(move || delete_comment(&state, &comment_id, &user.id)).await?;
    Ok(HttpResponse::Ok().json(Message::new("Comment deleted")))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/comments")
            .route("/{post_id}", web::post().to(handle_create))
            .route("/{id}", web::delete().to(handle_delete)),
    );
}
