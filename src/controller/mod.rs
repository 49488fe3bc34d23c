pub mod charm;
pub mod dispatcher;
pub mod error;
pub mod state;
pub mod store;

pub use charm::{Charm, CharmEvent, Disposition};
pub use dispatcher::{event_channel, Envelope};
pub use error::{is_forbidden, is_not_found, BackoffConfig, Error, Result};
pub use state::{CharmStatus, StatusLog, WaitReason};
pub use store::{ConfigMapStore, MemoryStore, StateStore, StoredState, SCHEMA_VERSION};
