//! TCP package exchange with neighbors

pub mod connection;
pub mod framing;
pub mod pool;
pub mod server;
pub mod transport;

pub use connection::{Connection, Role};
pub use framing::{decode_package, encode_package, PackageDecode};
pub use pool::ConnectionPool;
pub use server::{SyncServer, SyncServerHandle};
pub use transport::{RetryPolicy, SyncEvent, Transport};
