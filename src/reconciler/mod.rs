//! The reconciler (§4.E): translates a `DesiredConfig` snapshot plus the
//! previously applied state into a new `AppliedState`, and drives that
//! diff through the data-plane client with the minimum set of mutations.

pub mod apply;
pub mod generate;
pub mod read_back;
pub mod slots;
pub mod state;

pub use apply::apply;
pub use generate::generate;
pub use read_back::read_back;
pub use state::{AppliedState, Backend, Frontend, FrontendFilter};

/// Process-wide knobs that shape generation but aren't part of the
/// desired state itself (§4.E "Generation rules", §9 `Options`
/// grounding). Built once from `RuntimeOptions` at startup.
#[derive(Debug, Clone)]
pub struct Options {
	pub enable_intentions: bool,
	pub log_requests: bool,
	pub log_socket: Option<String>,
	pub spoe_config_path: String,
	pub authz_agent_socket: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Dataplane(#[from] crate::dataplane::Error),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("read-back invariant violated: {0}")]
	InvariantViolation(String),
}
