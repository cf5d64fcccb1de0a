use actix_web::{web, HttpResponse};

use crate::config::*;
use crate::core::db::Store;
use crate::core::errors::ApiError;
use crate::core::helpers::run_blocking;
use crate::follow::{handle_follow, handle_unfollow};
use crate::models::models::{Post, Profile, User, UserSummary};
use crate::posts::resolve_posts;
use crate::AppState;

fn summaries(store: &Store, ids: &[String]) -> anyhow::Result<Vec<UserSummary>> {
    let keys: Vec<String> = ids.iter().map(|id| user_key(id)).collect();
    Ok(store
        .get_many::<User>(&keys)?
        .iter()
        .map(UserSummary::from)
        .collect())
}

/// Public profile: no credential, followers/following resolved to summaries,
/// the user's own posts newest first.
pub fn get_profile(state: &AppState, username: &str) -> Result<Profile, ApiError> {
    let store = &state.store;
    let not_found = || ApiError::not_found("User not found");

    let user_id: String = store.get_json(&username_key(username))?.ok_or_else(not_found)?;
    let user: User = store.get_json(&user_key(&user_id))?.ok_or_else(not_found)?;

    let feed: Vec<String> = store.get_json(FEED_KEY)?.unwrap_or_default();
    let keys: Vec<String> = feed.iter().map(|id| post_key(id)).collect();
    let posts: Vec<Post> = store
        .get_many::<Post>(&keys)?
        .into_iter()
        .filter(|p| p.user_id == user.id)
        .collect();

    Ok(Profile {
        followers: summaries(store, &user.followers)?,
        following: summaries(store, &user.following)?,
        posts: resolve_posts(store, posts)?,
        id: user.id,
        username: user.username,
        email: user.email,
        avatar: user.avatar,
        created_at: user.created_at,
    })
}

// === HTTP Handlers ===

pub async fn handle_profile(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let username = path.into_inner();
    let profile = run_blocking(move || get_profile(&state, &username)).await?;
    Ok(HttpResponse::Ok().json(profile))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/users")
            .route("/{username}", web::get().to(handle_profile))
            .route("/{username}/follow", web::post().to(handle_follow))
            .route("/{username}/unfollow", web::post().to(handle_unfollow)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::follow::follow_user;
    use crate::models::models::NewPost;
    use crate::posts::create_post;
    use crate::test_support::{register, state};

    #[test]
    fn profile_resolves_relationships_and_posts() {
        let state = state();
        let alice = register(&state, "alice");
        let bob = register(&state, "bob");
        follow_user(&state, "alice", &bob.id).unwrap();
        create_post(&state, &alice.id, NewPost { content: "mine".into(), image: None }).unwrap();
        create_post(&state, &bob.id, NewPost { content: "not mine".into(), image: None }).unwrap();

        let profile = get_profile(&state, "alice").unwrap();
        assert_eq!(profile.id, alice.id);
        assert_eq!(profile.followers, vec![UserSummary::from(&bob)]);
        assert!(profile.following.is_empty());
        assert_eq!(profile.posts.len(), 1);
        assert_eq!(profile.posts[0].content, "mine");

        let json = serde_json::to_value(&profile).unwrap();
        assert!(json.get("password").is_none());
    }

    #[test]
    fn unknown_user_is_not_found() {
        let state = state();
        assert!(matches!(get_profile(&state, "ghost"), Err(ApiError::NotFound(_))));
    }
}
