//! The stable server slot table algorithm (§4.E "Stable server slot
//! table"): in-place server edits that never recreate a backend merely
//! because upstream node membership changed.

use std::collections::HashMap;

use crate::cert_store::TlsPaths;
use crate::dataplane::model::{Maintenance, Server, SslMode, Verify};
use crate::watch::desired::UpstreamNode;

const DISABLED_ADDRESS: &str = "127.0.0.1";
const DISABLED_PORT: i64 = 1;

fn disabled_server(name: String, tls: &TlsPaths) -> Server {
	Server {
		name,
		address: DISABLED_ADDRESS.to_string(),
		port: DISABLED_PORT,
		weight: 1,
		ssl: Some(SslMode::Enabled),
		ssl_certificate: Some(tls.cert_path.clone()),
		ssl_cafile: Some(tls.ca_path.clone()),
		verify: Some(Verify::Required),
		maintenance: Maintenance::Enabled,
	}
}

fn addr_key(s: &Server) -> String {
	if s.maintenance == Maintenance::Enabled {
		"maint".to_string()
	} else {
		format!("{}:{}", s.address, s.port)
	}
}

fn node_key(n: &UpstreamNode) -> String {
	format!("{}:{}", n.host, n.port)
}

/// Computes the next slot table for a backend, given its previous slots
/// (empty if the backend is new) and the desired node set. Slot names
/// (`srv_<i>`) are stable across calls; only content at existing indices
/// changes, and new indices are only ever appended.
pub fn next_slots(prev: &[Server], nodes: &[UpstreamNode], tls: &TlsPaths) -> Vec<Server> {
	let mut servers: Vec<Server> = prev.to_vec();

	let desired_idx: HashMap<String, &UpstreamNode> = nodes.iter().map(|n| (node_key(n), n)).collect();
	let existing_idx: HashMap<String, usize> = servers
		.iter()
		.enumerate()
		.map(|(i, s)| (addr_key(s), i))
		.collect();

	let mut free_slots: Vec<usize> = Vec::new();

	// Disable slots whose node left the desired set. Already-disabled slots
	// are re-disabled and re-added to the free list too: their addr key is
	// "maint", which is never in the desired set, so they aren't skipped.
	for (i, server) in servers.iter_mut().enumerate() {
		if desired_idx.contains_key(&addr_key(server)) {
			continue;
		}
		*server = disabled_server(format!("srv_{i}"), tls);
		free_slots.push(i);
	}

	// Fill free slots (or grow the table) for nodes not already active.
	for node in nodes {
		if existing_idx.contains_key(&node_key(node)) {
			continue;
		}

		if free_slots.is_empty() {
			let len = servers.len();
			let add = if len == 0 { 1 } else { len };
			for i in 0..add {
				let idx = i + len;
				servers.push(disabled_server(format!("srv_{idx}"), tls));
				free_slots.push(idx);
			}
		}

		let idx = free_slots.remove(0);
		servers[idx] = Server {
			name: format!("srv_{idx}"),
			address: node.host.clone(),
			port: node.port as i64,
			weight: node.weight as i64,
			ssl: Some(SslMode::Enabled),
			ssl_certificate: Some(tls.cert_path.clone()),
			ssl_cafile: Some(tls.ca_path.clone()),
			verify: Some(Verify::Required),
			maintenance: Maintenance::Disabled,
		};
	}

	servers
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tls() -> TlsPaths {
		TlsPaths { cert_path: "/base/cert".into(), ca_path: "/base/ca".into() }
	}

	fn node(host: &str, port: u16, weight: u32) -> UpstreamNode {
		UpstreamNode { name: format!("{host}:{port}"), host: host.into(), port, weight }
	}

	#[test]
	fn fresh_backend_allocates_one_slot_per_node() {
		let slots = next_slots(&[], &[node("1.2.3.4", 8080, 5), node("1.2.3.5", 8081, 8)], &tls());
		assert_eq!(slots.len(), 2);
		assert_eq!(slots[0].name, "srv_0");
		assert_eq!(slots[1].name, "srv_1");
		assert_eq!(slots[0].address, "1.2.3.4");
		assert_eq!(slots[1].address, "1.2.3.5");
	}

	// S2 — node removal preserves slots.
	#[test]
	fn node_removal_disables_its_slot_in_place() {
		let tls = tls();
		let initial = next_slots(&[], &[node("1.2.3.4", 8080, 5), node("1.2.3.5", 8081, 8)], &tls);
		let next = next_slots(&initial, &[node("1.2.3.5", 8081, 8)], &tls);

		assert_eq!(next.len(), 2);
		assert_eq!(next[0].name, "srv_0");
		assert_eq!(next[0].maintenance, Maintenance::Enabled);
		assert_eq!(next[0].address, "127.0.0.1");
		assert_eq!(next[0].port, 1);
		assert_eq!(next[0].weight, 1);
		assert_eq!(next[1], initial[1]);
	}

	// S3 — node re-add fills the freed slot.
	#[test]
	fn node_readd_reuses_the_freed_slot() {
		let tls = tls();
		let initial = next_slots(&[], &[node("1.2.3.4", 8080, 5), node("1.2.3.5", 8081, 8)], &tls);
		let removed = next_slots(&initial, &[node("1.2.3.5", 8081, 8)], &tls);
		let readded = next_slots(&removed, &[node("1.2.3.4", 8080, 5), node("1.2.3.5", 8081, 8)], &tls);

		assert_eq!(readded.len(), 2);
		assert_eq!(readded[0].name, "srv_0");
		assert_eq!(readded[0].address, "1.2.3.4");
		assert_eq!(readded[0].maintenance, Maintenance::Disabled);
		assert_eq!(readded[1], removed[1]);
	}

	#[test]
	fn table_doubles_when_no_free_slots_remain() {
		let tls = tls();
		let initial = next_slots(&[], &[node("1.2.3.4", 8080, 1)], &tls);
		assert_eq!(initial.len(), 1);
		let grown = next_slots(&initial, &[node("1.2.3.4", 8080, 1), node("1.2.3.5", 8081, 1)], &tls);
		assert_eq!(grown.len(), 2);
		assert_eq!(grown[0], initial[0]);
		assert_eq!(grown[1].name, "srv_1");
		assert_eq!(grown[1].address, "1.2.3.5");
	}

	#[test]
	fn idempotent_rerun_yields_equal_table() {
		let tls = tls();
		let nodes = [node("1.2.3.4", 8080, 5), node("1.2.3.5", 8081, 8)];
		let first = next_slots(&[], &nodes, &tls);
		let second = next_slots(&first, &nodes, &tls);
		assert_eq!(first, second);
	}
}
