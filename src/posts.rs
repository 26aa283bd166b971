use anyhow::anyhow;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, error, info, warn};

use crate::{
    database::Database,
    error::{format_reset, ApiError},
    identity::IdentityProvider,
    rate_limit::RateLimiter,
    types::{AuthorProfile, Post, PostWithAuthor},
};

/// Size of the single feed page.
pub const FEED_LIMIT: usize = 100;
pub const MAX_CONTENT_CHARS: usize = 255;

pub struct PostsService {
    db: Arc<Database>,
    identity: Arc<dyn IdentityProvider>,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl PostsService {
    pub fn new(
        db: Arc<Database>,
        identity: Arc<dyn IdentityProvider>,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            db,
            identity,
            rate_limiter,
        }
    }

    /// The newest posts, each paired with its author's profile.
    ///
    /// Every post must resolve to an author. A post whose author the identity
    /// provider does not return fails the whole call instead of being dropped.
    pub async fn get_all(&self) -> Result<Vec<PostWithAuthor>, ApiError> {
        let posts = self.db.find_many_posts(FEED_LIMIT as i64).await?;
        if posts.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let author_ids: Vec<String> = posts
            .iter()
            .filter(|post| seen.insert(post.author_id.as_str()))
            .map(|post| post.author_id.clone())
            .collect();

        let authors: HashMap<String, AuthorProfile> = self
            .identity
            .get_user_list(&author_ids, FEED_LIMIT)
            .await?
            .into_iter()
            .map(|author| (author.id.clone(), author))
            .collect();

        posts
            .into_iter()
            .map(|post| match authors.get(&post.author_id) {
                Some(author) => Ok(PostWithAuthor {
                    author: author.clone(),
                    post,
                }),
                None => {
                    error!(
                        "Author {} not found for post {}",
                        post.author_id, post.id
                    );
                    Err(ApiError::Internal(anyhow!(
                        "Author not found for post {}",
                        post.id
                    )))
                }
            })
            .collect()
    }

    pub async fn create(&self, author_id: &str, content: &str) -> Result<Post, ApiError> {
        validate_content(content)?;

        let outcome = self.rate_limiter.limit(author_id).await?;
        if !outcome.success {
            warn!(
                "Rate limit exceeded for {}, resets at {}",
                author_id,
                format_reset(&outcome.reset)
            );
            return Err(ApiError::TooManyRequests {
                reset: outcome.reset,
            });
        }

        debug!("{} has {} posts left in window", author_id, outcome.remaining);

        let post = self.db.create_post(author_id, content).await?;
        info!("Created post {} for {}", post.id, author_id);
        Ok(post)
    }
}

pub fn validate_content(content: &str) -> Result<(), ApiError> {
    let len = content.chars().count();
    if len == 0 {
        return Err(ApiError::Validation("Content must not be empty".to_string()));
    }
    if len > MAX_CONTENT_CHARS {
        return Err(ApiError::Validation(format!(
            "Content must be at most {} characters, got {}",
            MAX_CONTENT_CHARS, len
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rate_limit::{MemoryRateLimiter, RateLimitConfig, RateLimitOutcome};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::Mutex;

    /// Identity provider backed by a fixed user list. Records every lookup.
    #[derive(Default)]
    pub(crate) struct StaticDirectory {
        users: Vec<AuthorProfile>,
        pub(crate) calls: Mutex<Vec<Vec<String>>>,
    }

    impl StaticDirectory {
        pub(crate) fn with_users(ids: &[&str]) -> Self {
            Self {
                users: ids.iter().map(|id| profile(id)).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for StaticDirectory {
        async fn get_user_list(
            &self,
            ids: &[String],
            limit: usize,
        ) -> Result<Vec<AuthorProfile>> {
            self.calls.lock().unwrap().push(ids.to_vec());
            Ok(self
                .users
                .iter()
                .filter(|u| ids.contains(&u.id))
                .take(limit)
                .cloned()
                .collect())
        }
    }

    struct DownLimiter;

    #[async_trait]
    impl RateLimiter for DownLimiter {
        async fn limit(&self, _key: &str) -> Result<RateLimitOutcome> {
            Err(anyhow!("connection refused"))
        }
    }

    pub(crate) fn profile(id: &str) -> AuthorProfile {
        AuthorProfile {
            id: id.to_string(),
            display_name: Some(format!("{}_name", id)),
            email: Some(format!("{}@example.com", id)),
            profile_image_url: format!("https://img.example.com/{}.png", id),
        }
    }

    async fn setup(users: &[&str]) -> Result<(Arc<Database>, Arc<StaticDirectory>, PostsService)> {
        let db = Arc::new(Database::new(":memory:").await?);
        db.migrate().await?;
        let directory = Arc::new(StaticDirectory::with_users(users));
        let service = PostsService::new(
            Arc::clone(&db),
            directory.clone(),
            Arc::new(MemoryRateLimiter::new(RateLimitConfig::default())),
        );
        Ok((db, directory, service))
    }

    #[test]
    fn test_validate_content_bounds() {
        assert!(matches!(validate_content(""), Err(ApiError::Validation(_))));
        assert!(matches!(
            validate_content(&" ".repeat(256)),
            Err(ApiError::Validation(_))
        ));
        assert!(validate_content("a").is_ok());
        assert!(validate_content(" ").is_ok());
        assert!(validate_content(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn test_validate_content_counts_characters() {
        // 255 multi-byte characters are still within the limit
        assert!(validate_content(&"é".repeat(255)).is_ok());
        assert!(validate_content(&"é".repeat(256)).is_err());
    }

    #[tokio::test]
    async fn test_create_then_feed() -> Result<()> {
        let (_db, _directory, service) = setup(&["u1"]).await?;

        for _ in 0..3 {
            service.create("u1", "hello").await?;
        }

        let err = service.create("u1", "hello").await.unwrap_err();
        match err {
            ApiError::TooManyRequests { reset } => assert!(reset >= Utc::now()),
            other => panic!("expected throttling, got {:?}", other),
        }

        let feed = service.get_all().await?;
        assert_eq!(feed.len(), 3);
        for entry in &feed {
            assert_eq!(entry.post.content, "hello");
            assert_eq!(entry.author, profile("u1"));
        }
        for pair in feed.windows(2) {
            assert!(pair[0].post.created_at >= pair[1].post.created_at);
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_content_has_no_side_effects() -> Result<()> {
        let (db, _directory, service) = setup(&["u1"]).await?;

        for _ in 0..5 {
            let err = service.create("u1", "").await.unwrap_err();
            assert_eq!(err.kind(), "VALIDATION_ERROR");
            let err = service.create("u1", &" ".repeat(256)).await.unwrap_err();
            assert_eq!(err.kind(), "VALIDATION_ERROR");
        }
        assert!(db.find_many_posts(10).await?.is_empty());

        // Rejected attempts did not consume the limiter budget
        for _ in 0..3 {
            service.create("u1", "still allowed").await?;
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_throttled_create_persists_nothing() -> Result<()> {
        let (db, _directory, service) = setup(&["u1", "u2"]).await?;

        for _ in 0..3 {
            service.create("u1", "hi").await?;
        }
        assert!(service.create("u1", "one too many").await.is_err());
        service.create("u2", "other author").await?;

        let posts = db.find_many_posts(10).await?;
        assert_eq!(posts.len(), 4);
        assert!(posts.iter().all(|p| p.content != "one too many"));

        Ok(())
    }

    #[tokio::test]
    async fn test_limiter_failure_is_internal() -> Result<()> {
        let db = Arc::new(Database::new(":memory:").await?);
        db.migrate().await?;
        let service = PostsService::new(
            Arc::clone(&db),
            Arc::new(StaticDirectory::with_users(&["u1"])),
            Arc::new(DownLimiter),
        );

        let err = service.create("u1", "hello").await.unwrap_err();
        assert_eq!(err.kind(), "INTERNAL_SERVER_ERROR");
        assert!(db.find_many_posts(10).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_empty_feed_skips_identity_lookup() -> Result<()> {
        let (_db, directory, service) = setup(&["u1"]).await?;

        assert!(service.get_all().await?.is_empty());
        assert!(directory.calls.lock().unwrap().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_feed_batches_distinct_authors() -> Result<()> {
        let (db, directory, service) = setup(&["u1", "u2"]).await?;
        let now = Utc::now();

        for (i, author) in ["u1", "u2", "u1", "u1"].iter().enumerate() {
            db.insert_post(&Post {
                id: format!("p{}", i),
                author_id: author.to_string(),
                content: format!("post {}", i),
                created_at: now + Duration::seconds(i as i64),
            })
            .await?;
        }

        let feed = service.get_all().await?;
        let ids: Vec<&str> = feed.iter().map(|e| e.post.id.as_str()).collect();
        assert_eq!(ids, vec!["p3", "p2", "p1", "p0"]);
        assert_eq!(feed[2].author.id, "u2");

        let calls = directory.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["u1".to_string(), "u2".to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn test_feed_caps_at_limit() -> Result<()> {
        let (db, _directory, service) = setup(&["u1"]).await?;
        let now = Utc::now();

        for i in 0..(FEED_LIMIT + 20) {
            db.insert_post(&Post {
                id: format!("p{:03}", i),
                author_id: "u1".to_string(),
                content: "bulk".to_string(),
                created_at: now + Duration::milliseconds(i as i64),
            })
            .await?;
        }

        let feed = service.get_all().await?;
        assert_eq!(feed.len(), FEED_LIMIT);
        assert_eq!(feed[0].post.id, format!("p{:03}", FEED_LIMIT + 19));

        Ok(())
    }

    #[tokio::test]
    async fn test_orphaned_post_fails_whole_feed() -> Result<()> {
        let (db, _directory, service) = setup(&["u1"]).await?;

        service.create("u1", "fine").await?;
        db.insert_post(&Post {
            id: "orphan".to_string(),
            author_id: "ghost".to_string(),
            content: "who wrote this".to_string(),
            created_at: Utc::now() - Duration::hours(1),
        })
        .await?;

        let err = service.get_all().await.unwrap_err();
        assert_eq!(err.kind(), "INTERNAL_SERVER_ERROR");
        assert_eq!(err.to_string(), "Author not found for post orphan");

        Ok(())
    }
}
