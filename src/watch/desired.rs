//! The desired-state snapshot produced by the watcher and consumed by the
//! reconciler.

use std::time::Duration;

pub const DEFAULT_DOWNSTREAM_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_UPSTREAM_BIND_ADDR: &str = "127.0.0.1";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
	Http,
	Tcp,
}

impl Protocol {
	pub fn parse(s: &str) -> Self {
		match s {
			"tcp" => Protocol::Tcp,
			_ => Protocol::Http,
		}
	}
}

/// Which mesh-agent mechanism an upstream's node list is sourced from.
/// Kept as a tagged variant rather than subclassing per §9's "deep
/// inheritance: none" note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
	Service,
	PreparedQuery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tls {
	pub ca_pem_chain: Vec<String>,
	pub cert_pem: String,
	pub key_pem: String,
}

impl Tls {
	pub fn is_ready(&self) -> bool {
		!self.cert_pem.is_empty() && !self.key_pem.is_empty()
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Downstream {
	pub bind_addr: String,
	pub bind_port: u16,
	pub target_addr: String,
	pub target_port: u16,
	pub protocol: Protocol,
	pub connect_timeout: Duration,
	pub read_timeout: Duration,
	pub enable_forward_for: bool,
	pub app_name_header: Option<String>,
	pub tls: Tls,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamNode {
	pub name: String,
	pub host: String,
	pub port: u16,
	pub weight: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
	pub name: String,
	pub kind: UpstreamKind,
	pub local_bind_addr: String,
	pub local_bind_port: u16,
	pub protocol: Protocol,
	pub connect_timeout: Duration,
	pub read_timeout: Duration,
	pub nodes: Vec<UpstreamNode>,
	pub tls: Tls,
}

impl Upstream {
	/// Upstream name is `<destination_type>_<destination_name>`.
	pub fn name_for(kind: UpstreamKind, destination_name: &str) -> String {
		let ty = match kind {
			UpstreamKind::Service => "service",
			UpstreamKind::PreparedQuery => "prepared_query",
		};
		format!("{ty}_{destination_name}")
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredConfig {
	pub service_id: String,
	pub service_name: String,
	pub downstream: Downstream,
	/// Sorted by `name`; §3 invariant: names are unique within a snapshot.
	pub upstreams: Vec<Upstream>,
}

impl DesiredConfig {
	pub fn sort_upstreams(&mut self) {
		self.upstreams.sort_by(|a, b| a.name.cmp(&b.name));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn upstream_name_encodes_destination_type() {
		assert_eq!(
			Upstream::name_for(UpstreamKind::Service, "web"),
			"service_web"
		);
		assert_eq!(
			Upstream::name_for(UpstreamKind::PreparedQuery, "pq-web"),
			"prepared_query_pq-web"
		);
	}

	#[test]
	fn sort_upstreams_orders_by_name() {
		let mut cfg = DesiredConfig {
			service_id: "s".into(),
			service_name: "s".into(),
			downstream: Downstream {
				bind_addr: "0.0.0.0".into(),
				bind_port: 1,
				target_addr: "127.0.0.1".into(),
				target_port: 2,
				protocol: Protocol::Http,
				connect_timeout: DEFAULT_CONNECT_TIMEOUT,
				read_timeout: DEFAULT_READ_TIMEOUT,
				enable_forward_for: false,
				app_name_header: None,
				tls: Tls { ca_pem_chain: vec![], cert_pem: String::new(), key_pem: String::new() },
			},
			upstreams: vec![
				upstream("service_zeta"),
				upstream("service_alpha"),
			],
		};
		cfg.sort_upstreams();
		assert_eq!(cfg.upstreams[0].name, "service_alpha");
		assert_eq!(cfg.upstreams[1].name, "service_zeta");
	}

	fn upstream(name: &str) -> Upstream {
		Upstream {
			name: name.to_string(),
			kind: UpstreamKind::Service,
			local_bind_addr: "127.0.0.1".into(),
			local_bind_port: 8080,
			protocol: Protocol::Http,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
			read_timeout: DEFAULT_READ_TIMEOUT,
			nodes: vec![],
			tls: Tls { ca_pem_chain: vec![], cert_pem: String::new(), key_pem: String::new() },
		}
	}
}
