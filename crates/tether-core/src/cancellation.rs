use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Run id -> cancellation token. `cancel_run` trips the token; every
/// in-flight step observes it at its next suspension point.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(id.to_string(), token.clone());
        token
    }

    pub async fn get(&self, id: &str) -> Option<CancellationToken> {
        self.tokens.read().await.get(id).cloned()
    }

    pub async fn cancel(&self, id: &str) -> bool {
        match self.tokens.read().await.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &str) {
        self.tokens.write().await.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_trips_the_registered_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("run-1").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("run-1").await);
        assert!(token.is_cancelled());
        assert!(!registry.cancel("run-2").await);
    }
}
