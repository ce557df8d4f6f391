//! The authorization callback server: HELLO negotiation, NOTIFY handling,
//! and the single-flight authorization + certificate caches.

pub mod action;
pub mod cache;
pub mod hello;
pub mod message;
pub mod server;

pub use action::{Action, VarScope};
pub use message::Message;
pub use server::CallbackServer;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Codec(#[from] crate::codec::Error),
	#[error("protocol violation: {0}")]
	Protocol(String),
	#[error("unsupported version(s): {0}")]
	UnsupportedVersion(String),
	#[error("missing required capability: {0}")]
	MissingCapability(&'static str),
	#[error("authorization request timed out")]
	Timeout,
	#[error("certificate parse error: {0}")]
	CertParse(String),
	#[error("upstream authorization RPC failed: {0}")]
	Upstream(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Http(#[from] reqwest::Error),
}
