//! HTTP client for the mesh agent's blocking-query API (§6): CA roots,
//! leaf certificates, service/proxy definitions, connect-health, prepared
//! queries, and the intention-authorization RPC.

pub mod authorizer;
pub mod client;
pub mod model;

pub use authorizer::MeshAuthorizer;
pub use client::MeshClient;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Http(#[from] reqwest::Error),
	#[error("mesh agent returned status {status}: {body}")]
	Status { status: u16, body: String },
	#[error("no connect-proxy service registered for sidecar of {0}")]
	ProxyNotFound(String),
}
