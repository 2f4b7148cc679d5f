use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// A set of LINE user ids.
///
/// Backs both the paid-user entitlement set and the record of who has
/// already been told their user id. Implementations decide where the ids
/// live; handlers only see this interface.
#[async_trait]
pub trait UserSet: Send + Sync {
    /// Adds `user_id`. Returns `true` if it was not already present.
    async fn insert(&self, user_id: &str) -> bool;

    /// Removes `user_id`. Returns `true` if it was present.
    async fn remove(&self, user_id: &str) -> bool;

    async fn contains(&self, user_id: &str) -> bool;

    async fn len(&self) -> usize;
}

/// Process-memory set, lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryUserSet {
    users: RwLock<HashSet<String>>,
}

impl InMemoryUserSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set pre-populated with `users` (the seed list from config).
    pub fn with_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: RwLock::new(users.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl UserSet for InMemoryUserSet {
    async fn insert(&self, user_id: &str) -> bool {
        self.users.write().await.insert(user_id.to_string())
    }

    async fn remove(&self, user_id: &str) -> bool {
        self.users.write().await.remove(user_id)
    }

    async fn contains(&self, user_id: &str) -> bool {
        self.users.read().await.contains(user_id)
    }

    async fn len(&self) -> usize {
        self.users.read().await.len()
    }
}
