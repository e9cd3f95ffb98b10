//! ConnectionFactory - transport seam of the pool

use async_trait::async_trait;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use xrun_foundation::Result;

/// Opens, health-checks and closes transport handles for a [`ConnectionPool`]
///
/// `Key` is the pool identity. Two targets with equal keys share connections.
///
/// [`ConnectionPool`]: crate::ConnectionPool
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static;
    type Handle: Send + Sync + 'static;

    /// Establish a new connection (including authentication)
    async fn connect(&self, key: &Self::Key) -> Result<Self::Handle>;

    /// Cheap liveness check, run before an idle connection is reused
    async fn health_check(&self, handle: &Self::Handle) -> bool;

    /// Tear a connection down. Errors are the factory's to log.
    async fn close(&self, handle: Self::Handle) {
        drop(handle);
    }
}
