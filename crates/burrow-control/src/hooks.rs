//! Collaborator hooks
//!
//! Authentication and endpoint-notification are external services; the
//! control plane only needs these two call shapes. Both hooks are
//! best-effort from the server's point of view: notify errors are logged
//! and never fail the operation that triggered them.

use async_trait::async_trait;
use thiserror::Error;

/// Error surfaced by a collaborator hook
#[derive(Debug, Error)]
#[error("hook error: {0}")]
pub struct HookError(pub String);

/// Validates client bearer tokens during the control handshake
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn auth(&self, token: &str) -> Result<bool, HookError>;
}

/// Registers/deregisters public endpoints with an external system
/// (DNS, load balancer fan-out, …)
#[async_trait]
pub trait MemberNotifier: Send + Sync {
    async fn add_member(&self, domain: &str, public_addr: &str) -> Result<(), HookError>;
    async fn remove_member(&self, domain: &str, public_addr: &str) -> Result<(), HookError>;
}

/// Accepts every token; the default when auth is disabled
pub struct AllowAllAuth;

#[async_trait]
impl AuthProvider for AllowAllAuth {
    async fn auth(&self, _token: &str) -> Result<bool, HookError> {
        Ok(true)
    }
}

/// Notifier that does nothing
pub struct NoopNotifier;

#[async_trait]
impl MemberNotifier for NoopNotifier {
    async fn add_member(&self, _domain: &str, _public_addr: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn remove_member(&self, _domain: &str, _public_addr: &str) -> Result<(), HookError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all_auth() {
        assert!(AllowAllAuth.auth("anything").await.unwrap());
        assert!(AllowAllAuth.auth("").await.unwrap());
    }

    #[tokio::test]
    async fn test_noop_notifier() {
        NoopNotifier
            .add_member("example.com", "example.com:4000")
            .await
            .unwrap();
        NoopNotifier
            .remove_member("example.com", "example.com:4000")
            .await
            .unwrap();
    }
}
