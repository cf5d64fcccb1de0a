use std::collections::HashMap;

use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::config::*;
use crate::core::db::Store;
use crate::core::errors::ApiError;
use crate::core::helpers::{run_blocking, sanitize_text, validate_uuid};
use crate::models::models::{
    Comment, CommentView, LikeResponse, Message, NewPost, Post, PostView, User, UserSummary,
};
use crate::AppState;

/// Trims and strips markup; rejects empty or oversized text. The limit
/// counts the characters the caller sent.
pub fn clean_content(content: &str, max_len: usize) -> Result<String, ApiError> {
    let content = content.trim();
    if content.chars().count() > max_len {
        return Err(ApiError::bad_request("Invalid content"));
    }
    let content = sanitize_text(content).trim().to_string();
    if content.is_empty() {
        return Err(ApiError::bad_request("Invalid content"));
    }
    Ok(content)
}

fn post_not_found() -> ApiError {
    ApiError::not_found("Post not found")
}

// === Resolution ===

/// Memoizes owner lookups while resolving a batch of posts.
struct Owners<'a> {
    store: &'a Store,
    seen: HashMap<String, Option<UserSummary>>,
}

impl<'a> Owners<'a> {
    fn new(store: &'a Store) -> Self {
        Self {
            store,
            seen: HashMap::new(),
        }
    }

    fn get(&mut self, user_id: &str) -> anyhow::Result<Option<UserSummary>> {
        if let Some(summary) = self.seen.get(user_id) {
            return Ok(summary.clone());
        }
        let summary = self
            .store
            .get_json::<User>(&user_key(user_id))?
            .map(|u| UserSummary::from(&u));
        self.seen.insert(user_id.to_string(), summary.clone());
        Ok(summary)
    }
}

fn comment_view(owners: &mut Owners<'_>, comment: Comment) -> anyhow::Result<CommentView> {
    Ok(CommentView {
        user: owners.get(&comment.user_id)?,
        id: comment.id,
        post_id: comment.post_id,
        content: comment.content,
        created_at: comment.created_at,
    })
}

/// Inlines each post's owner and its comments (with their owners).
pub fn resolve_posts(store: &Store, posts: Vec<Post>) -> anyhow::Result<Vec<PostView>> {
    let mut owners = Owners::new(store);
    let mut views = Vec::with_capacity(posts.len());

    for post in posts {
        let comment_keys: Vec<String> = post.comments.iter().map(|id| comment_key(id)).collect();
        let comments = store
            .get_many::<Comment>(&comment_keys)?
            .into_iter()
            .map(|c| comment_view(&mut owners, c))
            .collect::<anyhow::Result<Vec<_>>>()?;

        views.push(PostView {
            user: owners.get(&post.user_id)?,
            id: post.id,
            content: post.content,
            image: post.image,
            likes: post.likes,
            comments,
            created_at: post.created_at,
        });
    }

    Ok(views)
}

pub fn resolve_comment(store: &Store, comment: Comment) -> anyhow::Result<CommentView> {
    comment_view(&mut Owners::new(store), comment)
}

// === Operations ===

pub fn create_post(state: &AppState, user_id: &str, req: NewPost) -> Result<Post, ApiError> {
    let content = clean_content(&req.content, MAX_POST_LENGTH)?;
    let image = req.image.map(|i| i.trim().to_string()).filter(|i| !i.is_empty());
    let post = Post::new(user_id, content, image);

    state.store.transaction(|tx| {
        let mut feed = tx.get_list(FEED_KEY)?;
        feed.insert(0, post.id.clone()); // newest first
        tx.set_json(&post_key(&post.id), &post)?;
        tx.set_json(FEED_KEY, &feed)?;
        Ok::<_, ApiError>(())
    })?;

    tracing::info!(post_id = %post.id, user_id = %user_id, "created post");
    Ok(post)
}

#[derive(Deserialize, Debug, Default)]
pub struct ListQuery {
    /// Only posts by this username.
    pub user: Option<String>,
    /// 1-based; absent means every post.
    pub page: Option<usize>,
}

/// The feed, newest first.
pub fn list_posts(state: &AppState, query: &ListQuery) -> Result<Vec<PostView>, ApiError> {
    let store = &state.store;
    let feed: Vec<String> = store.get_json(FEED_KEY)?.unwrap_or_default();
    let keys: Vec<String> = feed.iter().map(|id| post_key(id)).collect();
    let mut posts = store.get_many::<Post>(&keys)?;

    if let Some(username) = &query.user {
        match store.get_json::<String>(&username_key(username))? {
            Some(user_id) => posts.retain(|p| p.user_id == user_id),
            None => posts.clear(),
        }
    }

    if let Some(page) = query.page {
        let start = page.saturating_sub(1).saturating_mul(POSTS_PER_PAGE);
        posts = posts.into_iter().skip(start).take(POSTS_PER_PAGE).collect();
    }

    Ok(resolve_posts(store, posts)?)
}

pub fn get_post(state: &AppState, post_id: &str) -> Result<PostView, ApiError> {
    if !validate_uuid(post_id) {
        return Err(post_not_found());
    }
    let post = state
        .store
        .get_json::<Post>(&post_key(post_id))?
        .ok_or_else(post_not_found)?;

    resolve_posts(&state.store, vec![post])?
        .pop()
        .ok_or_else(post_not_found)
}

/// Flips `user_id`'s membership in the like set. Returns whether the post is
/// now liked, and the new like count.
pub fn toggle_like(state: &AppState, post_id: &str, user_id: &str) -> Result<(bool, usize), ApiError> {
    state.store.transaction(|tx| {
        let key = post_key(post_id);
        let mut post: Post = tx.get_json(&key)?.ok_or_else(post_not_found)?;

        let liked = match post.likes.iter().position(|id| id == user_id) {
            Some(idx) => {
                post.likes.remove(idx);
                false
            }
            None => {
                post.likes.push(user_id.to_string());
                true
            }
        };

        tx.set_json(&key, &post)?;
        tracing::debug!(post_id = %post_id, user_id = %user_id, liked, "toggled like");
        Ok((liked, post.likes.len()))
    })
}

/// Owner-only. Removes the post, its feed entry and its comments together.
pub fn delete_post(state: &AppState, post_id: &str, user_id: &str) -> Result<(), ApiError> {
    state.store.transaction(|tx| {
        let key = post_key(post_id);
        let post: Post = tx.get_json(&key)?.ok_or_else(post_not_found)?;

        if post.user_id != user_id {
            return Err(ApiError::Forbidden);
        }

        for comment_id in &post.comments {
            tx.delete(&comment_key(comment_id));
        }
        tx.delete(&key);

        let mut feed = tx.get_list(FEED_KEY)?;
        feed.retain(|id| id != post_id);
        tx.set_json(FEED_KEY, &feed)?;

        tracing::info!(post_id = %post_id, comments = post.comments.len(), "deleted post");
        Ok(())
    })
}

// === HTTP Handlers ===

pub async fn handle_create(
    state: web::Data<AppState>,
    AuthUser(user): AuthUser,
    body: web::Json<NewPost>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    let post = run_blocking(move || create_post(&state, &user.id, body)).await?;
    Ok(HttpResponse::Created().json(post))
}

pub async fn handle_list(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, ApiError> {
    let query = query.into_inner();
    let posts = run_blocking(move || list_posts(&state, &query)).await?;
    Ok(HttpResponse::Ok().json(posts))
}

pub async fn handle_get(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    let post = run_blocking(move || get_post(&state, &post_id)).await?;
    Ok(HttpResponse::Ok().json(post))
}

pub async fn handle_like(
    state: web::Data<AppState>,
    AuthUser(user): AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    let (liked, likes) = run_blocking(move || toggle_like(&state, &post_id, &user.id)).await?;
    let message = if liked { "Liked post" } else { "Unliked post" };
    Ok(HttpResponse::Ok().json(LikeResponse {
        message: message.to_string(),
        liked,
        likes,
    }))
}

pub async fn handle_delete(
    state: web::Data<AppState>,
    AuthUser(user): AuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    run_blocking(move || delete_post(&state, &post_id, &user.id)).await?;
    Ok(HttpResponse::Ok().json(Message::new("Post deleted")))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/posts")
            .route("", web::get().to(handle_list))
            .route("", web::post().to(handle_create))
            .route("/{id}", web::get().to(handle_get))
            .route("/{id}", web::delete().to(handle_delete))
            .route("/{id}/like", web::post().to(handle_like)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comments::create_comment;
    use crate::models::models::NewComment;
    use crate::test_support::{register, state};

    fn new_post(content: &str) -> NewPost {
        NewPost {
            content: content.to_string(),
            image: None,
        }
    }

    #[test]
    fn content_rules() {
        assert!(matches!(clean_content("   ", 10), Err(ApiError::BadRequest(_))));
        assert!(matches!(clean_content("x".repeat(11).as_str(), 10), Err(ApiError::BadRequest(_))));
        assert_eq!(clean_content("  <i>hello</i> ", 10).unwrap(), "hello");
        assert!(matches!(clean_content("<b></b>", 10), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn limit_counts_the_text_as_sent() {
        let ampersands = "&".repeat(MAX_COMMENT_LENGTH);
        assert_eq!(clean_content(&ampersands, MAX_COMMENT_LENGTH).unwrap(), ampersands);
        assert_eq!(clean_content("Tom & Jerry", 20).unwrap(), "Tom & Jerry");
    }

    #[test]
    fn like_then_unlike_restores_state() {
        let state = state();
        let alice = register(&state, "alice");
        let bob = register(&state, "bob");
        let post = create_post(&state, &alice.id, new_post("hello")).unwrap();

        assert_eq!(toggle_like(&state, &post.id, &bob.id).unwrap(), (true, 1));
        assert_eq!(get_post(&state, &post.id).unwrap().likes, vec![bob.id.clone()]);
        assert_eq!(toggle_like(&state, &post.id, &bob.id).unwrap(), (false, 0));
        assert!(get_post(&state, &post.id).unwrap().likes.is_empty());
    }

    #[test]
    fn like_missing_post_is_not_found() {
        let state = state();
        let alice = register(&state, "alice");
        let result = toggle_like(&state, &crate::core::helpers::new_id(), &alice.id);
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[test]
    fn feed_is_newest_first_with_owners() {
        let state = state();
        let alice = register(&state, "alice");
        let bob = register(&state, "bob");
        create_post(&state, &alice.id, new_post("first")).unwrap();
        create_post(&state, &bob.id, new_post("second")).unwrap();

        let feed = list_posts(&state, &ListQuery::default()).unwrap();
        let contents: Vec<_> = feed.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["second", "first"]);
        assert_eq!(feed[0].user.as_ref().unwrap().username, "bob");

        let only_alice = list_posts(
            &state,
            &ListQuery {
                user: Some("alice".to_string()),
                page: None,
            },
        )
        .unwrap();
        assert_eq!(only_alice.len(), 1);
        assert_eq!(only_alice[0].content, "first");
    }

    #[test]
    fn pages_hold_a_fixed_number_of_posts() {
        let state = state();
        let alice = register(&state, "alice");
        for i in 0..(POSTS_PER_PAGE + 5) {
            create_post(&state, &alice.id, new_post(&format!("post {i}"))).unwrap();
        }

        let page = |n| {
            list_posts(&state, &ListQuery { user: None, page: Some(n) })
                .unwrap()
                .len()
        };
        assert_eq!(page(1), POSTS_PER_PAGE);
        assert_eq!(page(2), 5);
        assert_eq!(page(3), 0);
        assert_eq!(page(0), POSTS_PER_PAGE);
        assert_eq!(page(usize::MAX), 0);
    }

    #[test]
    fn only_owner_deletes_and_comments_go_with_the_post() {
        let state = state();
        let alice = register(&state, "alice");
        let bob = register(&state, "bob");
        let post = create_post(&state, &alice.id, new_post("hello")).unwrap();
        let comment = create_comment(
            &state,
            &post.id,
            &bob.id,
            NewComment {
                content: "hi".to_string(),
            },
        )
        .unwrap();

        assert!(matches!(delete_post(&state, &post.id, &bob.id), Err(ApiError::Forbidden)));

        delete_post(&state, &post.id, &alice.id).unwrap();
        assert!(matches!(get_post(&state, &post.id), Err(ApiError::NotFound(_))));
        assert!(!state.store.exists(&comment_key(&comment.id)).unwrap());
        assert!(list_posts(&state, &ListQuery::default()).unwrap().is_empty());
        assert!(matches!(
            delete_post(&state, &post.id, &alice.id),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn malformed_id_is_not_found() {
        let state = state();
        assert!(matches!(get_post(&state, "not-an-id"), Err(ApiError::NotFound(_))));
    }
}
