//! # xrun-pool
//!
//! Reusable transport connections, bounded per target identity.
//!
//! - `ConnectionFactory` - how a transport opens, checks and closes a handle
//! - `ConnectionPool` - FIFO-fair acquisition with per-key and global limits
//! - `PooledConnection` - checkout guard; returns the connection on drop

pub mod connection;
pub mod factory;
pub mod pool;

pub use connection::{Connection, ConnectionState, PooledConnection};
pub use factory::ConnectionFactory;
pub use pool::{ConnectionPool, PoolStats};
