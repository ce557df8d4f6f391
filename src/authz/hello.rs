//! HELLO/AGENT_HELLO negotiation.

use crate::codec::value::{decode_kvs, encode_kv, Value};

use super::Error;

const KEY_MAX_FRAME_SIZE: &str = "max-frame-size";
const KEY_SUPPORTED_VERSIONS: &str = "supported-versions";
const KEY_VERSION: &str = "version";
const KEY_CAPABILITIES: &str = "capabilities";
const KEY_HEALTHCHECK: &str = "healthcheck";

const CAPABILITY_ASYNC: &str = "async";
const CAPABILITY_PIPELINING: &str = "pipelining";

const AGENT_VERSION: &str = "2.0";
const SUPPORTED_MAJOR_VERSION: u32 = 2;

/// Outcome of negotiating a HELLO: the frame size to use for this
/// connection, and whether the peer asked for a bare healthcheck (in
/// which case the connection closes immediately after the reply).
pub struct Negotiated {
	pub frame_size: u32,
	pub healthcheck: bool,
}

/// Parses the peer's HELLO payload and negotiates connection parameters.
/// Returns the reply K/V pairs to send in AGENT_HELLO alongside the
/// negotiated outcome, or an error describing why the peer should be
/// disconnected.
pub fn negotiate(payload: &[u8], local_max_frame_size: u32) -> Result<(Negotiated, Vec<(String, Value)>), Error> {
	let (kvs, _) = decode_kvs(payload, None)?;
	let get = |key: &str| kvs.iter().find(|(k, _)| k == key).map(|(_, v)| v);

	let remote_frame_size = match get(KEY_MAX_FRAME_SIZE) {
		Some(Value::UInt32(v)) => *v,
		Some(Value::UInt64(v)) => *v as u32,
		_ => return Err(Error::Protocol(format!("hello: expected {KEY_MAX_FRAME_SIZE}"))),
	};

	let frame_size = remote_frame_size.min(local_max_frame_size);

	let supported_versions = match get(KEY_SUPPORTED_VERSIONS) {
		Some(Value::String(s)) => s.clone(),
		_ => return Err(Error::Protocol(format!("hello: expected {KEY_SUPPORTED_VERSIONS}"))),
	};

	let version_ok = supported_versions
		.split(',')
		.map(parse_major_version)
		.any(|major| major == Some(SUPPORTED_MAJOR_VERSION));
	if !version_ok {
		return Err(Error::UnsupportedVersion(supported_versions));
	}

	let capabilities = match get(KEY_CAPABILITIES) {
		Some(Value::String(s)) => s.clone(),
		_ => return Err(Error::Protocol(format!("hello: expected {KEY_CAPABILITIES}"))),
	};
	if !has_capability(&capabilities, CAPABILITY_ASYNC) {
		return Err(Error::MissingCapability(CAPABILITY_ASYNC));
	}
	if !has_capability(&capabilities, CAPABILITY_PIPELINING) {
		return Err(Error::MissingCapability(CAPABILITY_PIPELINING));
	}

	let healthcheck = matches!(get(KEY_HEALTHCHECK), Some(Value::Bool(true)));

	let reply = vec![
		(KEY_VERSION.to_string(), Value::String(AGENT_VERSION.to_string())),
		(KEY_MAX_FRAME_SIZE.to_string(), Value::UInt32(frame_size)),
		(
			KEY_CAPABILITIES.to_string(),
			Value::String(format!("{CAPABILITY_ASYNC},{CAPABILITY_PIPELINING}")),
		),
	];

	Ok((Negotiated { frame_size, healthcheck }, reply))
}

/// Encodes the AGENT_HELLO/AGENT_DISCONNECT payload for a list of K/V pairs.
pub fn encode_payload(kvs: &[(String, Value)]) -> Vec<u8> {
	let mut out = Vec::new();
	for (k, v) in kvs {
		encode_kv(&mut out, k, v);
	}
	out
}

fn parse_major_version(v: &str) -> Option<u32> {
	v.trim().split('.').next()?.parse().ok()
}

fn has_capability(capabilities: &str, want: &str) -> bool {
	capabilities.split(',').any(|c| c.trim() == want)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hello_payload(max_frame_size: u32, versions: &str, capabilities: &str) -> Vec<u8> {
		let mut buf = Vec::new();
		encode_kv(&mut buf, KEY_MAX_FRAME_SIZE, &Value::UInt32(max_frame_size));
		encode_kv(&mut buf, KEY_SUPPORTED_VERSIONS, &Value::String(versions.to_string()));
		encode_kv(&mut buf, KEY_CAPABILITIES, &Value::String(capabilities.to_string()));
		buf
	}

	#[test]
	fn negotiates_the_smaller_frame_size() {
		let payload = hello_payload(8192, "2.0", "async,pipelining");
		let (negotiated, _) = negotiate(&payload, 16380).unwrap();
		assert_eq!(negotiated.frame_size, 8192);
		assert!(!negotiated.healthcheck);
	}

	#[test]
	fn rejects_incompatible_versions() {
		let payload = hello_payload(8192, "1.0", "async,pipelining");
		assert!(matches!(negotiate(&payload, 16380), Err(Error::UnsupportedVersion(_))));
	}

	#[test]
	fn rejects_missing_capabilities() {
		let payload = hello_payload(8192, "2.0", "async");
		assert!(matches!(
			negotiate(&payload, 16380),
			Err(Error::MissingCapability("pipelining"))
		));
	}
}
