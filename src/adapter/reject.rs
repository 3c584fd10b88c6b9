//! Reject adapter
//!
//! Refuses every connection. Used to block trackers outright.

use async_trait::async_trait;
use tracing::debug;

use super::traits::{AdapterConnection, AdapterFactory, AdapterKind};
use crate::error::AdapterError;
use crate::session::{ConnectSession, HostResolver};

/// Reject adapter factory
#[derive(Debug, Clone)]
pub struct RejectAdapterFactory {
    id: String,
}

impl RejectAdapterFactory {
    /// Create a reject adapter
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl AdapterFactory for RejectAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Reject
    }

    async fn connect(
        &self,
        session: &ConnectSession,
        _resolver: &dyn HostResolver,
    ) -> Result<AdapterConnection, AdapterError> {
        debug!("Rejecting connection to {} via {}", session.authority(), self.id);
        Err(AdapterError::Rejected {
            id: self.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SystemResolver;

    #[tokio::test]
    async fn test_reject_always_fails() {
        let adapter = RejectAdapterFactory::new("block");
        let session = ConnectSession::new("ads.example", 443, false, None).unwrap();
        let err = adapter.connect(&session, &SystemResolver).await.unwrap_err();
        assert!(matches!(err, AdapterError::Rejected { ref id } if id == "block"));
        assert!(!err.is_recoverable());
        assert_eq!(adapter.kind(), AdapterKind::Reject);
        assert!(!adapter.resolves_locally());
    }
}
