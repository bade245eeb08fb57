//! Mirrors remote message history into local storage: peer resolution, message
//! normalization, bootstrap/incremental passes, channel watermark resync and
//! the multi-account scheduler.

pub mod bridge;
pub mod clock;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod peer;
pub mod raw;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod watermark;

pub use bridge::HttpBridgeConnector;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{PassKind, PassMode, PassReport, SyncEngine};
pub use error::SyncError;
pub use registry::{ConnectionLease, ConnectionRegistry, CredentialFingerprint};
pub use remote::{
    Credentials, MissingRemoteConnector, PeerRef, RemoteConnector, RemoteError, RemoteSession,
};
pub use scheduler::{Scheduler, TickReport, UserSyncError};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
