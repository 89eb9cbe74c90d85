pub mod store;
pub mod types;

pub use store::SnapshotStore;
pub use types::{SnapshotEntry, SnapshotKind};
