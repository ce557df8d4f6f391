//! Transactional REST client for the proxy's management API (§4.C, §6).

pub mod client;
pub mod model;

pub use client::{DataplaneClient, Transaction};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Http(#[from] reqwest::Error),
	#[error("data-plane API returned status {status}: {body}")]
	Status { status: u16, body: String },
	#[error("no active transaction")]
	NoActiveTransaction,
}
