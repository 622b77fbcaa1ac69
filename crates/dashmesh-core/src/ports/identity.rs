//! IdentityProvider port: who owns this node.

use crate::domain::ids::Identity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthIdentity {
    pub id: Identity,
    pub email: Option<String>,
}

impl AuthIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Identity::new(id),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Human-readable label for chat lines.
    pub fn label(&self) -> &str {
        self.email.as_deref().unwrap_or(self.id.as_str())
    }
}

pub trait IdentityProvider: Send + Sync {
    /// `None` when nobody is signed in.
    fn current_identity(&self) -> Option<AuthIdentity>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_prefers_email() {
        assert_eq!(AuthIdentity::new("uid-1").label(), "uid-1");
        assert_eq!(
            AuthIdentity::new("uid-1").with_email("alice@example.com").label(),
            "alice@example.com"
        );
    }
}
