//! Tenant identity
//!
//! Tenant resolution proper (sessions, API keys) lives outside this crate;
//! the substrate only needs something that can answer "whose hook is
//! this". The static provider echoes the identity it was built with.

use async_trait::async_trait;

use world_core::AuthContext;

/// Resolves the tenant identity stamped onto hooks and health payloads
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn resolve(&self) -> AuthContext;
}

/// Fixed identity taken from configuration
pub struct StaticAuthProvider {
    context: AuthContext,
}

impl StaticAuthProvider {
    pub fn new(context: AuthContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn resolve(&self) -> AuthContext {
        self.context.clone()
    }
}
