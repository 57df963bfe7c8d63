//! External interfaces: upstream snapshot sources and subscriber fan-out

pub mod broadcast;
pub mod source;

pub use broadcast::{Broadcaster, SubscriberId};
pub use source::{ScriptedSource, SnapshotSource, SourceProvider, SyntheticProvider, SyntheticSource};
