use crate::ports::{AuthIdentity, IdentityProvider};

/// Fixed identity, for the demo binary and tests.
#[derive(Debug, Clone)]
pub struct StaticIdentity(Option<AuthIdentity>);

impl StaticIdentity {
    pub fn new(identity: AuthIdentity) -> Self {
        Self(Some(identity))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_identity(&self) -> Option<AuthIdentity> {
        self.0.clone()
    }
}
