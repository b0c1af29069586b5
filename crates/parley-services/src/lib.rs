//! parley-services — shared building blocks used by the node: the dedup
//! window, the session history and the display sink.

pub mod dedup;
pub mod history;
pub mod sink;

pub use dedup::SeenCache;
pub use history::{ChatEntry, Direction, MessageHistory};
pub use sink::{DisplaySink, NullSink};
