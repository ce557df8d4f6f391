//! The Watcher (§4.F): fan-in of mesh-agent subscriptions producing a
//! normalized, totally-ordered `DesiredConfig` stream.

pub mod desired;
pub mod ready;
pub mod watcher;

pub use desired::DesiredConfig;
pub use watcher::Watcher;
