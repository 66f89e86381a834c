pub mod backends;
pub mod template;

pub use template::{DatastoreKind, StartupCheck, StorageBackend};
