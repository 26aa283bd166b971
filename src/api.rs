use axum::{
    extract::{rejection::JsonRejection, FromRef, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    auth::{AuthenticatedUser, JwtVerifier},
    error::ApiError,
    posts::PostsService,
    types::{CreatePostInput, Post, PostWithAuthor},
};

#[derive(Clone)]
pub struct AppState {
    pub posts: Arc<PostsService>,
    pub verifier: Arc<JwtVerifier>,
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.verifier)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/posts.getAll", get(get_all_posts))
        .route("/api/posts.create", post(create_post))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "Chirp API"
}

async fn health() -> &'static str {
    "ok"
}

async fn get_all_posts(
    State(state): State<AppState>,
) -> Result<Json<Vec<PostWithAuthor>>, ApiError> {
    let feed = state.posts.get_all().await?;
    info!("Returning feed with {} posts", feed.len());
    Ok(Json(feed))
}

async fn create_post(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: Result<Json<CreatePostInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Post>), ApiError> {
    let Json(input) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;

    let post = state.posts.create(&user.user_id, &input.content).await?;
    Ok((StatusCode::CREATED, Json(post)))
}
