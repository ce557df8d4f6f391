//! Fan-in of long-poll subscriptions against the mesh agent, coalesced
//! into a single-slot "dirty" signal that drives a composed
//! `DesiredConfig` to the supervisor (§4.F).

use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::mesh::model::{AgentService, AggregatedStatus};
use crate::mesh::MeshClient;

use super::desired::{
	DesiredConfig, Downstream, Protocol, Tls, Upstream, UpstreamKind, UpstreamNode,
	DEFAULT_CONNECT_TIMEOUT, DEFAULT_DOWNSTREAM_BIND_ADDR, DEFAULT_READ_TIMEOUT, DEFAULT_UPSTREAM_BIND_ADDR,
};
use super::ready::ReadyBarrier;

const ERROR_WAIT: Duration = Duration::from_secs(5);
const PREPARED_QUERY_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default, Clone)]
struct DownstreamState {
	bind_addr: String,
	bind_port: u16,
	target_addr: String,
	target_port: u16,
	protocol: Option<Protocol>,
	connect_timeout: Duration,
	read_timeout: Duration,
	enable_forward_for: bool,
	app_name_header: Option<String>,
}

#[derive(Clone)]
struct UpstreamConfigState {
	kind: UpstreamKind,
	destination_name: String,
	datacenter: String,
	local_bind_addr: String,
	local_bind_port: u16,
	protocol: Protocol,
	connect_timeout: Duration,
	read_timeout: Duration,
	nodes: Vec<UpstreamNode>,
}

struct UpstreamEntry {
	config: UpstreamConfigState,
	abort: AbortHandle,
}

struct Shared {
	service_name: String,
	downstream: DownstreamState,
	ca_pem_chain: Vec<String>,
	leaf_cert_pem: String,
	leaf_key_pem: String,
	upstreams: HashMap<String, UpstreamEntry>,
}

/// Coalesces every subscription's output into one composed
/// `DesiredConfig`, delivered to `rx` whenever any input changes.
pub struct Watcher {
	mesh: MeshClient,
	service_id: String,
	shared: Arc<Mutex<Shared>>,
	dirty_tx: mpsc::Sender<()>,
	ready: Arc<ReadyBarrier>,
	shutdown: CancellationToken,
}

impl Watcher {
	pub fn new(mesh: MeshClient, service_id: String, shutdown: CancellationToken) -> (Self, mpsc::Receiver<()>) {
		let (dirty_tx, dirty_rx) = mpsc::channel(1);
		let watcher = Watcher {
			mesh,
			service_id,
			shared: Arc::new(Mutex::new(Shared {
				service_name: String::new(),
				downstream: DownstreamState::default(),
				ca_pem_chain: Vec::new(),
				leaf_cert_pem: String::new(),
				leaf_key_pem: String::new(),
				upstreams: HashMap::new(),
			})),
			dirty_tx,
			ready: Arc::new(ReadyBarrier::new(4)),
			shutdown,
		};
		(watcher, dirty_rx)
	}

	fn notify_dirty(&self) {
		let _ = self.dirty_tx.try_send(());
	}

	/// Starts the four fixed subscriptions (CA, leaf, local service,
	/// sidecar proxy service) and returns once the proxy id has been
	/// resolved. Per-upstream subscriptions are started dynamically as
	/// the sidecar proxy service's config is observed.
	pub async fn run(self: Arc<Self>) {
		let proxy_id = loop {
			match self.mesh.lookup_proxy_id_for_sidecar(&self.service_id).await {
				Ok(id) => break id,
				Err(e) => {
					error!(error = %e, "failed to resolve sidecar proxy id, retrying");
					tokio::time::sleep(ERROR_WAIT).await;
				}
			}
		};

		let service_name = match self.mesh.agent_service(&self.service_id, "").await {
			Ok((svc, _)) => svc.service,
			Err(_) => self.service_id.clone(),
		};
		self.shared.lock().await.service_name = service_name.clone();

		tokio::spawn(self.clone().watch_ca());
		tokio::spawn(self.clone().watch_leaf(service_name));
		tokio::spawn(self.clone().watch_local_service());
		tokio::spawn(self.clone().watch_proxy_service(proxy_id));
	}

	/// Blocks until every subscription active at startup has produced at
	/// least one value (§4.F "Startup readiness").
	pub async fn ready(&self) {
		self.ready.wait().await;
	}

	async fn watch_ca(self: Arc<Self>) {
		let mut index = 0u64;
		let mut first = true;
		loop {
			if self.shutdown.is_cancelled() {
				return;
			}
			match self.mesh.ca_roots(index).await {
				Ok((roots, meta)) => {
					let changed = index != meta.last_index;
					index = meta.last_index;
					if changed {
						info!(active_root_id = %roots.active_root_id, "CA roots changed");
						let mut shared = self.shared.lock().await;
						shared.ca_pem_chain = roots.roots.into_iter().map(|r| r.root_cert_pem).collect();
						drop(shared);
						self.notify_dirty();
					}
					if first {
						self.ready.arrive();
						first = false;
					}
				}
				Err(e) => {
					error!(error = %e, "error fetching CA roots");
					tokio::time::sleep(ERROR_WAIT).await;
					index = 0;
				}
			}
		}
	}

	async fn watch_leaf(self: Arc<Self>, service_name: String) {
		let mut index = 0u64;
		let mut first = true;
		loop {
			if self.shutdown.is_cancelled() {
				return;
			}
			match self.mesh.leaf_cert(&service_name, index).await {
				Ok((leaf, meta)) => {
					let changed = index != meta.last_index;
					index = meta.last_index;
					if changed {
						info!(serial = %leaf.serial_number, "leaf certificate changed");
						let mut shared = self.shared.lock().await;
						shared.leaf_cert_pem = leaf.cert_pem;
						shared.leaf_key_pem = leaf.private_key_pem;
						drop(shared);
						self.notify_dirty();
					}
					if first {
						self.ready.arrive();
						first = false;
					}
				}
				Err(e) => {
					error!(error = %e, "error fetching leaf certificate");
					tokio::time::sleep(ERROR_WAIT).await;
					index = 0;
				}
			}
		}
	}

	async fn watch_local_service(self: Arc<Self>) {
		let mut hash = String::new();
		let mut first = true;
		loop {
			if self.shutdown.is_cancelled() {
				return;
			}
			match self.mesh.agent_service(&self.service_id, &hash).await {
				Ok((svc, meta)) => {
					let changed = hash != meta.last_content_hash;
					hash = meta.last_content_hash.clone();
					if changed {
						let mut shared = self.shared.lock().await;
						shared.downstream.target_port = if svc.port != 0 {
							svc.port
						} else {
							free_ephemeral_port().unwrap_or(0)
						};
						if shared.downstream.target_addr.is_empty() {
							shared.downstream.target_addr = DEFAULT_UPSTREAM_BIND_ADDR.to_string();
						}
						drop(shared);
						self.notify_dirty();
					}
					if first {
						self.ready.arrive();
						first = false;
					}
				}
				Err(e) => {
					error!(error = %e, "error fetching local service");
					tokio::time::sleep(ERROR_WAIT).await;
					hash.clear();
				}
			}
		}
	}

	async fn watch_proxy_service(self: Arc<Self>, proxy_id: String) {
		let mut hash = String::new();
		let mut first = true;
		loop {
			if self.shutdown.is_cancelled() {
				return;
			}
			match self.mesh.agent_service(&proxy_id, &hash).await {
				Ok((svc, meta)) => {
					let changed = hash != meta.last_content_hash;
					hash = meta.last_content_hash.clone();
					if changed {
						self.apply_proxy_service(&svc, first).await;
						self.notify_dirty();
					}
					if first {
						self.ready.arrive();
						first = false;
					}
				}
				Err(e) => {
					error!(error = %e, "error fetching sidecar proxy service");
					tokio::time::sleep(ERROR_WAIT).await;
					hash.clear();
				}
			}
		}
	}

	async fn apply_proxy_service(self: &Arc<Self>, svc: &AgentService, is_startup: bool) {
		let mut shared = self.shared.lock().await;
		let downstream = &mut shared.downstream;
		downstream.bind_addr = DEFAULT_DOWNSTREAM_BIND_ADDR.to_string();
		downstream.bind_port = svc.port;
		downstream.target_addr = DEFAULT_UPSTREAM_BIND_ADDR.to_string();
		downstream.read_timeout = DEFAULT_READ_TIMEOUT;
		downstream.connect_timeout = DEFAULT_CONNECT_TIMEOUT;

		let mut keep = std::collections::HashSet::new();
		let mut to_start = Vec::new();

		if let Some(proxy) = &svc.proxy {
			if let Some(v) = proxy.config.get("protocol").and_then(|v| v.as_str()) {
				downstream.protocol = Some(Protocol::parse(v));
			}
			if let Some(v) = proxy.config.get("bind_address").and_then(|v| v.as_str()) {
				downstream.bind_addr = v.to_string();
			}
			if let Some(v) = proxy.config.get("local_service_address").and_then(|v| v.as_str()) {
				downstream.target_addr = v.to_string();
			}
			if let Some(v) = proxy.config.get("enable_forwardfor").and_then(|v| v.as_bool()) {
				downstream.enable_forward_for = v;
			}
			if let Some(v) = proxy.config.get("appname_header").and_then(|v| v.as_str()) {
				downstream.app_name_header = Some(v.to_string());
			}
			if let Some(v) = proxy.config.get("connect_timeout").and_then(|v| v.as_str()) {
				match parse_go_duration(v) {
					Some(d) => downstream.connect_timeout = d,
					None => warn!(value = %v, "bad connect_timeout, using default"),
				}
			}
			if let Some(v) = proxy.config.get("read_timeout").and_then(|v| v.as_str()) {
				match parse_go_duration(v) {
					Some(d) => downstream.read_timeout = d,
					None => warn!(value = %v, "bad read_timeout, using default"),
				}
			}

			for up in &proxy.upstreams {
				let kind = if up.destination_type == "prepared_query" {
					UpstreamKind::PreparedQuery
				} else {
					UpstreamKind::Service
				};
				let name = Upstream::name_for(kind, &up.destination_name);
				keep.insert(name.clone());

				if let Some(entry) = shared.upstreams.get_mut(&name) {
					update_upstream_config(&mut entry.config, up);
				} else {
					to_start.push((name, kind, up.clone()));
				}
			}
		}

		let removed: Vec<String> = shared
			.upstreams
			.keys()
			.filter(|name| !keep.contains(*name))
			.cloned()
			.collect();
		for name in removed {
			if let Some(entry) = shared.upstreams.remove(&name) {
				info!(upstream = %name, "removing upstream subscription");
				entry.abort.abort();
			}
		}
		drop(shared);

		if is_startup && !to_start.is_empty() {
			self.ready.extend(to_start.len());
		}
		for (name, kind, up) in to_start {
			self.clone().start_upstream(name, kind, up, is_startup).await;
		}
	}

	async fn start_upstream(
		self: Arc<Self>,
		name: String,
		kind: UpstreamKind,
		up: crate::mesh::model::AgentUpstream,
		initial: bool,
	) {
		let mut config = UpstreamConfigState {
			kind,
			destination_name: up.destination_name.clone(),
			datacenter: up.datacenter.clone(),
			local_bind_addr: String::new(),
			local_bind_port: up.local_bind_port,
			protocol: Protocol::Http,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
			read_timeout: DEFAULT_READ_TIMEOUT,
			nodes: Vec::new(),
		};
		update_upstream_config(&mut config, &up);

		let handle = match kind {
			UpstreamKind::Service => {
				tokio::spawn(self.clone().run_service_upstream(name.clone(), config.clone(), initial))
			}
			UpstreamKind::PreparedQuery => tokio::spawn(self.clone().run_prepared_query_upstream(
				name.clone(),
				config.clone(),
				up.config.clone(),
				initial,
			)),
		};

		self.shared.lock().await.upstreams.insert(
			name,
			UpstreamEntry { config, abort: handle.abort_handle() },
		);
	}

	async fn run_service_upstream(self: Arc<Self>, name: String, config: UpstreamConfigState, initial: bool) {
		info!(upstream = %name, "watching upstream service");
		let mut index = 0u64;
		let mut first = true;
		loop {
			if self.shutdown.is_cancelled() {
				return;
			}
			match self.mesh.connect_health(&config.destination_name, &config.datacenter, index).await {
				Ok((entries, meta)) => {
					let changed = index != meta.last_index;
					index = meta.last_index;
					if changed {
						let nodes = healthy_nodes(&entries);
						let mut shared = self.shared.lock().await;
						if let Some(entry) = shared.upstreams.get_mut(&name) {
							entry.config.nodes = nodes;
						}
						drop(shared);
						self.notify_dirty();
					}
					if first {
						if initial {
							self.ready.arrive();
						}
						first = false;
					}
				}
				Err(e) => {
					error!(upstream = %name, error = %e, "error fetching connect-health");
					tokio::time::sleep(ERROR_WAIT).await;
					index = 0;
				}
			}
		}
	}

	async fn run_prepared_query_upstream(
		self: Arc<Self>,
		name: String,
		config: UpstreamConfigState,
		raw_config: HashMap<String, serde_json::Value>,
		initial: bool,
	) {
		info!(upstream = %name, "watching upstream prepared_query");
		let interval = raw_config
			.get("poll_interval")
			.and_then(|v| v.as_str())
			.and_then(parse_go_duration)
			.unwrap_or(PREPARED_QUERY_POLL_INTERVAL);

		let mut last: Option<Vec<UpstreamNode>> = None;
		let mut first = true;
		loop {
			if self.shutdown.is_cancelled() {
				return;
			}
			match self.mesh.prepared_query_execute(&config.destination_name, &config.datacenter).await {
				Ok(result) => {
					let nodes = healthy_nodes(&result.nodes);
					if last.as_ref() != Some(&nodes) {
						let mut shared = self.shared.lock().await;
						if let Some(entry) = shared.upstreams.get_mut(&name) {
							entry.config.nodes = nodes.clone();
						}
						drop(shared);
						self.notify_dirty();
						last = Some(nodes);
					}
				}
				Err(e) => {
					error!(upstream = %name, error = %e, "error executing prepared query");
				}
			}
			if first {
				if initial {
					self.ready.arrive();
				}
				first = false;
			}
			tokio::time::sleep(interval).await;
		}
	}

	/// Builds the composed `DesiredConfig` from the current watcher
	/// state, sorted per §3's invariant.
	pub async fn desired_config(&self) -> Option<DesiredConfig> {
		let shared = self.shared.lock().await;
		if shared.leaf_cert_pem.is_empty() || shared.leaf_key_pem.is_empty() {
			return None;
		}
		let tls = Tls {
			ca_pem_chain: shared.ca_pem_chain.clone(),
			cert_pem: shared.leaf_cert_pem.clone(),
			key_pem: shared.leaf_key_pem.clone(),
		};

		let downstream = Downstream {
			bind_addr: shared.downstream.bind_addr.clone(),
			bind_port: shared.downstream.bind_port,
			target_addr: shared.downstream.target_addr.clone(),
			target_port: shared.downstream.target_port,
			protocol: shared.downstream.protocol.unwrap_or(Protocol::Http),
			connect_timeout: shared.downstream.connect_timeout,
			read_timeout: shared.downstream.read_timeout,
			enable_forward_for: shared.downstream.enable_forward_for,
			app_name_header: shared.downstream.app_name_header.clone(),
			tls: tls.clone(),
		};

		let mut upstreams: Vec<Upstream> = shared
			.upstreams
			.iter()
			.map(|(name, entry)| Upstream {
				name: name.clone(),
				kind: entry.config.kind,
				local_bind_addr: entry.config.local_bind_addr.clone(),
				local_bind_port: entry.config.local_bind_port,
				protocol: entry.config.protocol,
				connect_timeout: entry.config.connect_timeout,
				read_timeout: entry.config.read_timeout,
				nodes: entry.config.nodes.clone(),
				tls: tls.clone(),
			})
			.collect();
		upstreams.sort_by(|a, b| a.name.cmp(&b.name));

		Some(DesiredConfig {
			service_id: self.service_id.clone(),
			service_name: shared.service_name.clone(),
			downstream,
			upstreams,
		})
	}
}

fn update_upstream_config(config: &mut UpstreamConfigState, up: &crate::mesh::model::AgentUpstream) {
	config.local_bind_addr = if up.local_bind_address.is_empty() {
		DEFAULT_UPSTREAM_BIND_ADDR.to_string()
	} else {
		up.local_bind_address.clone()
	};
	config.local_bind_port = up.local_bind_port;
	config.datacenter = up.datacenter.clone();
	config.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
	config.read_timeout = DEFAULT_READ_TIMEOUT;

	if let Some(p) = up.config.get("protocol").and_then(|v| v.as_str()) {
		config.protocol = Protocol::parse(p);
	}
	if let Some(v) = up.config.get("read_timeout").and_then(|v| v.as_str()) {
		match parse_go_duration(v) {
			Some(d) => config.read_timeout = d,
			None => warn!(upstream = %config.destination_name, value = %v, "bad read_timeout, using default"),
		}
	}
	if let Some(v) = up.config.get("connect_timeout").and_then(|v| v.as_str()) {
		match parse_go_duration(v) {
			Some(d) => config.connect_timeout = d,
			None => warn!(upstream = %config.destination_name, value = %v, "bad connect_timeout, using default"),
		}
	}
}

/// Filters mesh health entries to nodes whose aggregated check status
/// passes or warns, weighted per §4.F; excludes zero-weight nodes.
fn healthy_nodes(entries: &[crate::mesh::model::ServiceEntry]) -> Vec<UpstreamNode> {
	let mut nodes = Vec::new();
	for entry in entries {
		let weight = match entry.aggregated_status() {
			AggregatedStatus::Passing => entry.service.weights.passing,
			AggregatedStatus::Warning => entry.service.weights.warning,
			AggregatedStatus::Other => continue,
		};
		if weight == 0 {
			continue;
		}
		let host = if entry.service.address.is_empty() {
			entry.node.address.clone()
		} else {
			entry.service.address.clone()
		};
		nodes.push(UpstreamNode {
			name: format!("{host}:{}", entry.service.port),
			host,
			port: entry.service.port,
			weight,
		});
	}
	nodes
}

/// A minimal subset of Go's `time.ParseDuration` covering the unit
/// suffixes the mesh agent's proxy config actually uses (`ms`, `s`,
/// `m`, `h`).
fn parse_go_duration(s: &str) -> Option<Duration> {
	let s = s.trim();
	let (num, unit) = s.split_at(s.find(|c: char| c.is_alphabetic())?);
	let value: f64 = num.parse().ok()?;
	let secs = match unit {
		"ms" => value / 1000.0,
		"s" => value,
		"m" => value * 60.0,
		"h" => value * 3600.0,
		_ => return None,
	};
	if secs < 0.0 {
		return None;
	}
	Some(Duration::from_secs_f64(secs))
}

fn free_ephemeral_port() -> std::io::Result<u16> {
	let listener = StdTcpListener::bind("127.0.0.1:0")?;
	Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_common_go_duration_suffixes() {
		assert_eq!(parse_go_duration("500ms"), Some(Duration::from_millis(500)));
		assert_eq!(parse_go_duration("5s"), Some(Duration::from_secs(5)));
		assert_eq!(parse_go_duration("2m"), Some(Duration::from_secs(120)));
		assert_eq!(parse_go_duration("garbage"), None);
	}

	#[test]
	fn free_ephemeral_port_returns_nonzero() {
		assert!(free_ephemeral_port().unwrap() > 0);
	}
}
