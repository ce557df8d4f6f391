//! CLI surface (§6) and the `RuntimeOptions` it maps onto. Argument
//! parsing itself is plumbing the core depends on only through this
//! struct; everything below it (process supervision, stats exporter,
//! config-file scaffolding) lives outside the core per spec's Non-goals.

use std::collections::HashMap;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "connect-sidecar", about = "Service-mesh sidecar proxy controller", disable_version_flag = true)]
pub struct Args {
	/// Print the version and verify the `-haproxy`/`-dataplane` binaries
	/// are resolvable, exiting 4 if either is missing (§6).
	#[arg(long = "version", default_value_t = false)]
	pub version: bool,

	/// Mesh agent HTTP address.
	#[arg(long = "http-addr", default_value = "127.0.0.1:8500")]
	pub http_addr: String,

	/// The mesh service to proxy for.
	#[arg(long = "sidecar-for")]
	pub sidecar_for: String,

	/// Optional tag disambiguating the sidecar proxy service lookup.
	#[arg(long = "sidecar-for-tag", default_value = "")]
	pub sidecar_for_tag: String,

	/// Data-plane proxy binary path.
	#[arg(long = "haproxy", default_value = "haproxy")]
	pub haproxy_bin: String,

	/// Data-plane management API binary path.
	#[arg(long = "dataplane", default_value = "dataplane-api")]
	pub dataplane_bin: String,

	/// Base directory for the per-run scoped scratch tree (§6 "On-disk layout").
	#[arg(long = "haproxy-cfg-base-path", default_value = "/tmp")]
	pub haproxy_cfg_base_path: String,

	/// Enable per-request access logging.
	#[arg(long = "haproxy-log-requests", default_value_t = false)]
	pub haproxy_log_requests: bool,

	/// Syslog socket address for access logs.
	#[arg(long = "haproxy-log-address", default_value = "")]
	pub haproxy_log_address: String,

	/// `tracing`/`RUST_LOG`-style log level.
	#[arg(long = "log-level", default_value = "info")]
	pub log_level: String,

	/// Listen address for the stats/metrics exporter.
	#[arg(long = "stats-addr", default_value = "")]
	pub stats_addr: String,

	/// Register a mesh service for the stats exporter.
	#[arg(long = "stats-service-register", default_value_t = false)]
	pub stats_service_register: bool,

	/// Enable intention-based authorization.
	#[arg(long = "enable-intentions", default_value_t = false)]
	pub enable_intentions: bool,

	/// Mesh agent ACL token.
	#[arg(long, default_value = "")]
	pub token: String,

	/// Repeated `defaults.<key>=<value>` / `global.<key>=<value>` overrides
	/// forwarded to the data plane's base configuration template.
	#[arg(long = "haproxy-param")]
	pub haproxy_param: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("bad -haproxy-param flag {0:?}, expected '{{type}}.{{name}}={{value}}'")]
	BadParam(String),
	#[error("-haproxy-param type must be 'defaults' or 'global', got {0:?}")]
	BadParamType(String),
}

/// `-haproxy-param` overrides, split by target section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaproxyParams {
	pub defaults: HashMap<String, String>,
	pub globals: HashMap<String, String>,
}

fn parse_haproxy_params(flags: &[String]) -> Result<HaproxyParams, Error> {
	let mut params = HaproxyParams::default();
	for flag in flags {
		let (key, value) = flag.split_once('=').ok_or_else(|| Error::BadParam(flag.clone()))?;
		let (section, name) = key.split_once('.').ok_or_else(|| Error::BadParam(flag.clone()))?;
		let target = match section {
			"defaults" => &mut params.defaults,
			"global" => &mut params.globals,
			other => return Err(Error::BadParamType(other.to_string())),
		};
		target.insert(name.to_string(), value.to_string());
	}
	Ok(params)
}

/// The resolved, validated runtime configuration the rest of the process
/// is built from. Mirrors the original program's `haproxy.Options` /
/// top-level flag set, translated into one struct instead of threading
/// raw flags through every constructor.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
	pub mesh_http_addr: String,
	pub sidecar_for: String,
	pub sidecar_for_tag: String,
	pub haproxy_bin: String,
	pub dataplane_bin: String,
	pub base_dir: std::path::PathBuf,
	pub log_requests: bool,
	pub log_address: Option<String>,
	pub stats_addr: Option<String>,
	pub stats_service_register: bool,
	pub enable_intentions: bool,
	pub token: Option<String>,
	pub haproxy_params: HaproxyParams,
}

impl RuntimeOptions {
	pub fn from_args(args: Args) -> Result<Self, Error> {
		let haproxy_params = parse_haproxy_params(&args.haproxy_param)?;
		Ok(RuntimeOptions {
			mesh_http_addr: args.http_addr,
			sidecar_for: args.sidecar_for,
			sidecar_for_tag: args.sidecar_for_tag,
			haproxy_bin: args.haproxy_bin,
			dataplane_bin: args.dataplane_bin,
			base_dir: std::path::PathBuf::from(args.haproxy_cfg_base_path),
			log_requests: args.haproxy_log_requests,
			log_address: non_empty(args.haproxy_log_address),
			stats_addr: non_empty(args.stats_addr),
			stats_service_register: args.stats_service_register,
			enable_intentions: args.enable_intentions,
			token: non_empty(args.token),
			haproxy_params,
		})
	}
}

fn non_empty(s: String) -> Option<String> {
	if s.is_empty() {
		None
	} else {
		Some(s)
	}
}
