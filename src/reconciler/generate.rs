//! Generation rules (§4.E "Generation rules"): builds the next
//! `AppliedState` from a `DesiredConfig`, reusing slot assignments from
//! the previously applied state so upstream node churn never forces a
//! backend recreate.

use crate::cert_store::CertStore;
use crate::dataplane::model::{
	Backend as BackendModel, Balance, BalanceAlgorithm, Bind, Filter, FilterType, Forwardfor, ForwardforEnabled,
	Frontend as FrontendModel, HttpRequestRule, HttpRequestRuleType, LogFacility, LogFormat, LogTarget, Maintenance,
	Mode, Server, TcpRequestRule, TcpRequestRuleAction, TcpRequestRuleType, Verify, Cond,
};
use crate::watch::desired::{DesiredConfig, Downstream, Protocol, Upstream};

use super::state::{AppliedState, Backend, Frontend, FrontendFilter};
use super::{Error, Options};

const INTENTIONS_BACKEND: &str = "spoe_back";
const SPOE_ENGINE: &str = "intentions";

fn mode_for(protocol: Protocol) -> Mode {
	match protocol {
		Protocol::Http => Mode::Http,
		Protocol::Tcp => Mode::Tcp,
	}
}

fn log_target(opts: &Options) -> Option<LogTarget> {
	if !opts.log_requests {
		return None;
	}
	let address = opts.log_socket.as_ref()?;
	Some(LogTarget {
		index: 0,
		address: address.clone(),
		facility: LogFacility::Local0,
		format: LogFormat::Rfc5424,
	})
}

fn millis(d: std::time::Duration) -> i64 {
	d.as_millis() as i64
}

/// The fixed intentions backend (§4.E "Intentions backend"): a single
/// server pointing at the authorization agent's callback socket.
fn generate_intentions_backend(opts: &Options) -> Backend {
	Backend {
		model: BackendModel {
			name: INTENTIONS_BACKEND.to_string(),
			mode: Mode::Tcp,
			connect_timeout: None,
			server_timeout: None,
			balance: None,
			forwardfor: None,
		},
		servers: vec![Server {
			name: "spoe-agent".to_string(),
			address: format!("unix@{}", opts.authz_agent_socket),
			port: 0,
			weight: 1,
			ssl: None,
			ssl_certificate: None,
			ssl_cafile: None,
			verify: None,
			maintenance: Maintenance::Disabled,
		}],
		log_target: None,
		http_request_rules: Vec::new(),
	}
}

fn generate_downstream(opts: &Options, cert_store: &CertStore, cfg: &Downstream) -> Result<(Frontend, Backend), Error> {
	let fe_name = "front_downstream";
	let be_name = "back_downstream";
	let mode = mode_for(cfg.protocol);

	let tls_paths = cert_store.materialize(&cfg.tls)?;

	let filter = if opts.enable_intentions {
		Some(FrontendFilter {
			filter: Filter {
				index: 0,
				filter_type: FilterType::Spoe,
				spoe_engine: SPOE_ENGINE.to_string(),
				spoe_config: opts.spoe_config_path.clone(),
			},
			tcp_request_rule: TcpRequestRule {
				index: 0,
				rule_type: TcpRequestRuleType::Content,
				action: TcpRequestRuleAction::Reject,
				cond: Cond::Unless,
				cond_test: "{ var(sess.connect.auth) -m int eq 1 }".to_string(),
			},
		})
	} else {
		None
	};

	let frontend = Frontend {
		model: FrontendModel {
			name: fe_name.to_string(),
			mode,
			default_backend: be_name.to_string(),
			client_timeout: millis(cfg.read_timeout),
			httplog: opts.log_requests,
		},
		bind: Bind {
			name: format!("{fe_name}_bind"),
			address: cfg.bind_addr.clone(),
			port: cfg.bind_port as i64,
			ssl: true,
			ssl_certificate: Some(tls_paths.cert_path.clone()),
			ssl_cafile: Some(tls_paths.ca_path.clone()),
			verify: Some(Verify::Required),
		},
		log_target: log_target(opts),
		filter,
	};

	let forwardfor = if cfg.enable_forward_for && mode == Mode::Http {
		Some(Forwardfor { enabled: ForwardforEnabled::Enabled })
	} else {
		None
	};

	let mut http_request_rules = Vec::new();
	if let Some(header) = &cfg.app_name_header {
		if mode == Mode::Http {
			http_request_rules.push(HttpRequestRule {
				index: 0,
				rule_type: HttpRequestRuleType::AddHeader,
				hdr_name: header.clone(),
				hdr_format: "%[var(sess.connect.source_app)]".to_string(),
			});
		}
	}

	let backend = Backend {
		model: BackendModel {
			name: be_name.to_string(),
			mode,
			connect_timeout: Some(millis(cfg.connect_timeout)),
			server_timeout: Some(millis(cfg.read_timeout)),
			balance: None,
			forwardfor,
		},
		servers: vec![Server {
			name: "downstream_node".to_string(),
			address: cfg.target_addr.clone(),
			port: cfg.target_port as i64,
			weight: 1,
			ssl: None,
			ssl_certificate: None,
			ssl_cafile: None,
			verify: None,
			maintenance: Maintenance::Disabled,
		}],
		log_target: log_target(opts),
		http_request_rules,
	};

	Ok((frontend, backend))
}

fn generate_upstream(opts: &Options, cert_store: &CertStore, cfg: &Upstream, prev: &AppliedState) -> Result<(Frontend, Backend), Error> {
	let fe_name = format!("front_{}", cfg.name);
	let be_name = format!("back_{}", cfg.name);

	let frontend = Frontend {
		model: FrontendModel {
			name: fe_name.clone(),
			mode: Mode::Http,
			default_backend: be_name.clone(),
			client_timeout: millis(cfg.read_timeout),
			httplog: opts.log_requests,
		},
		bind: Bind {
			name: format!("{fe_name}_bind"),
			address: cfg.local_bind_addr.clone(),
			port: cfg.local_bind_port as i64,
			ssl: false,
			ssl_certificate: None,
			ssl_cafile: None,
			verify: None,
		},
		log_target: log_target(opts),
		filter: None,
	};

	let tls_paths = cert_store.materialize(&cfg.tls)?;
	let prev_servers = prev.backend(&be_name).map(|b| b.servers.as_slice()).unwrap_or(&[]);
	let servers = super::slots::next_slots(prev_servers, &cfg.nodes, &tls_paths);

	let backend = Backend {
		model: BackendModel {
			name: be_name,
			mode: Mode::Http,
			connect_timeout: Some(millis(cfg.connect_timeout)),
			server_timeout: Some(millis(cfg.read_timeout)),
			balance: Some(Balance { algorithm: BalanceAlgorithm::Leastconn }),
			forwardfor: None,
		},
		servers,
		log_target: log_target(opts),
		http_request_rules: Vec::new(),
	};

	Ok((frontend, backend))
}

/// Builds the next `AppliedState` (§4.E "Generation rules"). Reuses
/// `prev`'s server slots per backend so `apply` can hot-patch rather than
/// recreate backends whose node set merely changed.
pub fn generate(opts: &Options, cert_store: &CertStore, prev: &AppliedState, desired: &DesiredConfig) -> Result<AppliedState, Error> {
	let mut next = AppliedState::empty();

	if opts.enable_intentions {
		next.backends.push(generate_intentions_backend(opts));
	}

	let (fe, be) = generate_downstream(opts, cert_store, &desired.downstream)?;
	next.frontends.push(fe);
	next.backends.push(be);

	for upstream in &desired.upstreams {
		let (fe, be) = generate_upstream(opts, cert_store, upstream, prev)?;
		next.frontends.push(fe);
		next.backends.push(be);
	}

	next.sort();
	Ok(next)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::watch::desired::{Tls, UpstreamKind, UpstreamNode, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};

	fn tls() -> Tls {
		Tls { ca_pem_chain: vec!["CA".into()], cert_pem: "CERT".into(), key_pem: "KEY".into() }
	}

	fn opts() -> Options {
		Options {
			enable_intentions: true,
			log_requests: false,
			log_socket: None,
			spoe_config_path: "/run/spoe.conf".into(),
			authz_agent_socket: "/run/spoe.sock".into(),
		}
	}

	fn store() -> CertStore {
		let mut dir = std::env::temp_dir();
		dir.push(format!("connect-sidecar-generate-test-{}", std::process::id()));
		CertStore::new(dir).unwrap()
	}

	fn desired() -> DesiredConfig {
		DesiredConfig {
			service_id: "web-1".into(),
			service_name: "web".into(),
			downstream: Downstream {
				bind_addr: "0.0.0.0".into(),
				bind_port: 21000,
				target_addr: "127.0.0.1".into(),
				target_port: 8080,
				protocol: Protocol::Http,
				connect_timeout: DEFAULT_CONNECT_TIMEOUT,
				read_timeout: DEFAULT_READ_TIMEOUT,
				enable_forward_for: false,
				app_name_header: None,
				tls: tls(),
			},
			upstreams: vec![
				Upstream {
					name: "service_server".into(),
					kind: UpstreamKind::Service,
					local_bind_addr: "127.0.0.1".into(),
					local_bind_port: 8081,
					protocol: Protocol::Http,
					connect_timeout: DEFAULT_CONNECT_TIMEOUT,
					read_timeout: DEFAULT_READ_TIMEOUT,
					nodes: vec![UpstreamNode { name: "n1".into(), host: "1.2.3.4".into(), port: 9000, weight: 1 }],
					tls: tls(),
				},
				Upstream {
					name: "prepared_query_pq-service".into(),
					kind: UpstreamKind::PreparedQuery,
					local_bind_addr: "127.0.0.1".into(),
					local_bind_port: 8082,
					protocol: Protocol::Http,
					connect_timeout: DEFAULT_CONNECT_TIMEOUT,
					read_timeout: DEFAULT_READ_TIMEOUT,
					nodes: vec![],
					tls: tls(),
				},
			],
		}
	}

	// S1 — service add.
	#[test]
	fn service_add_produces_expected_frontends_and_backends() {
		let store = store();
		let next = generate(&opts(), &store, &AppliedState::empty(), &desired()).unwrap();

		let mut names: Vec<&str> = next.frontends.iter().map(|f| f.model.name.as_str()).collect();
		names.sort();
		assert_eq!(names, vec!["front_downstream", "front_prepared_query_pq-service", "front_service_server"]);

		let mut backend_names: Vec<&str> = next.backends.iter().map(|b| b.model.name.as_str()).collect();
		backend_names.sort();
		assert_eq!(
			backend_names,
			vec!["back_downstream", "back_prepared_query_pq-service", "back_service_server", "spoe_back"]
		);

		let downstream_bind = &next.frontend("front_downstream").unwrap().bind;
		assert!(downstream_bind.ssl);
		assert_eq!(downstream_bind.verify, Some(Verify::Required));

		let upstream_bind = &next.frontend("front_service_server").unwrap().bind;
		assert!(!upstream_bind.ssl);
	}

	#[test]
	fn node_churn_keeps_backend_identity_across_generations() {
		let store = store();
		let mut first_desired = desired();
		let first = generate(&opts(), &store, &AppliedState::empty(), &first_desired).unwrap();

		first_desired.upstreams[0].nodes.push(UpstreamNode {
			name: "n2".into(),
			host: "1.2.3.5".into(),
			port: 9001,
			weight: 1,
		});
		let second = generate(&opts(), &store, &first, &first_desired).unwrap();

		let first_backend = first.backend("back_service_server").unwrap();
		let second_backend = second.backend("back_service_server").unwrap();
		assert_eq!(first_backend.servers[0], second_backend.servers[0]);
		assert_eq!(second_backend.servers.len(), 2);
	}

	#[test]
	fn regenerating_from_own_output_is_idempotent() {
		let store = store();
		let d = desired();
		let first = generate(&opts(), &store, &AppliedState::empty(), &d).unwrap();
		let second = generate(&opts(), &store, &first, &d).unwrap();
		assert_eq!(first, second);
	}
}
