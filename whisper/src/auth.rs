//! Hook into the external authentication collaborator.
//!
//! The sync core never refreshes or stores credentials itself. It asks the
//! provider for the current bearer token before every request or connection
//! and reports rejections back to it.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Supplies bearer credentials and receives authentication failures.
pub trait AuthProvider: Send + Sync {
    /// The bearer token to present, if any.
    fn bearer_token(&self) -> Option<String>;

    /// Called whenever a channel rejects the current credential.
    fn on_unauthorized(&self);
}

/// A fixed token, typically read from configuration.
#[derive(Debug, Default)]
pub struct StaticToken {
    token: Option<String>,
    rejections: AtomicUsize,
}

impl StaticToken {
    /// Wraps a token. `None` sends requests unauthenticated.
    #[must_use]
    pub const fn new(token: Option<String>) -> Self {
        Self {
            token,
            rejections: AtomicUsize::new(0),
        }
    }

    /// How many times a channel has rejected this token.
    #[must_use]
    pub fn rejections(&self) -> usize {
        self.rejections.load(Ordering::Relaxed)
    }
}

impl AuthProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn on_unauthorized(&self) {
        let count = self.rejections.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(rejections = count, "credential rejected by server");
    }
}
