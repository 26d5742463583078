//! Account service collaborator.
//!
//! Registration and descriptor upload go through the relay operator's HTTP
//! account API, which lives outside this crate. The session only needs the
//! two calls below.

use uuid::Uuid;

use crate::error::Result;
use crate::transport::BoxFuture;

/// The account API as seen by a device session.
///
/// Implementations report bad credentials or a deleted device as
/// [`LyncnatError::FatalIdentity`](crate::error::LyncnatError::FatalIdentity).
pub trait AccountService: Send + Sync {
    /// Register a new device called `name` and return its UUID.
    fn register_device<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Uuid>>;

    /// Upload the JSON capability descriptor for `device`.
    fn push_descriptor<'a>(
        &'a self,
        device: Uuid,
        api_key: &'a str,
        descriptor: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Account service for running without the HTTP API.
///
/// Registration mints a random UUID locally and descriptors are only
/// logged. Suitable for demos and for relays that accept any device UUID.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineAccount;

impl AccountService for OfflineAccount {
    fn register_device<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Uuid>> {
        Box::pin(async move {
            let uuid = Uuid::new_v4();
            tracing::warn!(
                "No account service configured, using locally generated UUID {} for '{}'",
                uuid,
                name
            );
            Ok(uuid)
        })
    }

    fn push_descriptor<'a>(
        &'a self,
        device: Uuid,
        _api_key: &'a str,
        descriptor: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tracing::info!(%device, "Descriptor: {}", descriptor);
            Ok(())
        })
    }
}
