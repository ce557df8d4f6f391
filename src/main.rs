//! Binary entry point: parses the CLI surface (§6), wires the watcher,
//! reconciler, authorization agent, and supervisor together, and runs
//! until a shutdown signal arrives.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use connect_sidecar::authz::CallbackServer;
use connect_sidecar::cert_store::CertStore;
use connect_sidecar::config::{Args, RuntimeOptions};
use connect_sidecar::dataplane::DataplaneClient;
use connect_sidecar::mesh::{MeshAuthorizer, MeshClient};
use connect_sidecar::process::ProcessSupervisor;
use connect_sidecar::reconciler::Options as ReconcilerOptions;
use connect_sidecar::supervisor::{ProxySupervisor, Supervisor};
use connect_sidecar::watch::Watcher;

/// Matches `dataplaneUser`/`dataplanePass` in `haproxy/dataplane.go`: the
/// data-plane API's fixed local credentials, not a real secret.
const DATAPLANE_USER: &str = "haproxy";
const DATAPLANE_PASS: &str = "pass";

fn install_logging(level: &str) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Resolves whether `bin` exists, either as a path or on `$PATH`, for
/// `-version`'s dependency check (§6).
fn dependency_present(bin: &str) -> bool {
	if bin.contains(std::path::MAIN_SEPARATOR) {
		return Path::new(bin).is_file();
	}
	std::env::var_os("PATH")
		.map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file()))
		.unwrap_or(false)
}

/// `-version`: print the version, then check that `-haproxy`/`-dataplane`
/// resolve to real binaries, exiting 4 if either is missing (§6 "Exit...
/// 4 on dependency-missing from -version").
fn run_version_check(args: &Args) -> anyhow::Result<()> {
	println!("connect-sidecar {}", env!("CARGO_PKG_VERSION"));

	let missing: Vec<&str> = [args.haproxy_bin.as_str(), args.dataplane_bin.as_str()]
		.into_iter()
		.filter(|bin| !dependency_present(bin))
		.collect();

	if !missing.is_empty() {
		for bin in &missing {
			eprintln!("missing dependency: {bin}");
		}
		std::process::exit(4);
	}
	Ok(())
}

fn free_ephemeral_port() -> std::io::Result<u16> {
	let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
	Ok(listener.local_addr()?.port())
}

/// Watches for SIGTERM/SIGINT (double Ctrl+C exits immediately, mirroring
/// `agentgateway`'s `core::signal`) and cancels `shutdown` once.
fn spawn_signal_watcher(shutdown: CancellationToken) {
	tokio::spawn(async move {
		#[cfg(unix)]
		{
			use tokio::signal::unix::{signal, SignalKind};
			let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
			let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
			tokio::select! {
				_ = sigterm.recv() => info!("received SIGTERM, shutting down"),
				_ = sigint.recv() => info!("received SIGINT, shutting down"),
			}
		}
		#[cfg(not(unix))]
		{
			let _ = tokio::signal::ctrl_c().await;
			info!("received ctrl-c, shutting down");
		}
		shutdown.cancel();
	});
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	if args.version {
		install_logging("error");
		return run_version_check(&args);
	}

	let log_level = args.log_level.clone();
	install_logging(&log_level);

	let opts = RuntimeOptions::from_args(args)?;

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(opts))
}

async fn run(opts: RuntimeOptions) -> anyhow::Result<()> {
	let shutdown = CancellationToken::new();
	spawn_signal_watcher(shutdown.clone());

	let run_dir = opts.base_dir.join(format!("connect-sidecar-{}", std::process::id()));
	let cert_store = CertStore::new(&run_dir)?;
	let spoe_config_path = run_dir.join("spoe.conf");
	let spoe_socket_path = run_dir.join("spoe.sock");
	let haproxy_config_path = run_dir.join("haproxy.conf");
	let dataplane_tx_dir = run_dir.join("dataplane-transactions");

	let mesh = MeshClient::new(format!("http://{}", opts.mesh_http_addr), opts.token.clone());

	let (watcher, dirty_rx) = Watcher::new(mesh.clone(), opts.sidecar_for.clone(), shutdown.clone());
	let watcher = Arc::new(watcher);
	{
		let watcher = watcher.clone();
		tokio::spawn(async move { watcher.run().await });
	}

	let authorizer = Arc::new(MeshAuthorizer::new(mesh.clone(), opts.sidecar_for.clone()));
	let callback_server = CallbackServer::new(authorizer);
	{
		let callback_server = callback_server.clone();
		let spoe_socket_path = spoe_socket_path.clone();
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			tokio::select! {
				res = callback_server.serve_unix(&spoe_socket_path) => {
					if let Err(e) = res {
						error!(error = %e, "authorization agent exited");
					}
				}
				_ = shutdown.cancelled() => {}
			}
		});
	}

	let dataplane_port = free_ephemeral_port()?;
	let dataplane_base_url = format!("http://127.0.0.1:{dataplane_port}");
	let dataplane = DataplaneClient::new(dataplane_base_url.clone(), Some(DATAPLANE_USER.to_string()), Some(DATAPLANE_PASS.to_string()));

	let haproxy_args = vec!["-f".to_string(), display(&haproxy_config_path)];
	let dataplane_args = vec![
		"--scheme".to_string(),
		"http".to_string(),
		"--host".to_string(),
		"127.0.0.1".to_string(),
		"--port".to_string(),
		dataplane_port.to_string(),
		"--haproxy-bin".to_string(),
		opts.haproxy_bin.clone(),
		"--config-file".to_string(),
		display(&haproxy_config_path),
		"--userlist".to_string(),
		"controller".to_string(),
		"--transaction-dir".to_string(),
		display(&dataplane_tx_dir),
	];
	let proxy: Arc<dyn ProxySupervisor> = Arc::new(ProcessSupervisor::new(
		opts.haproxy_bin.clone(),
		haproxy_args,
		opts.dataplane_bin.clone(),
		dataplane_args,
		dataplane_base_url,
	));

	let reconciler_opts = ReconcilerOptions {
		enable_intentions: opts.enable_intentions,
		log_requests: opts.log_requests,
		log_socket: opts.log_address.clone(),
		spoe_config_path: display(&spoe_config_path),
		authz_agent_socket: display(&spoe_socket_path),
	};

	let (supervisor, supervisor_ready) = Supervisor::new(proxy, dataplane, cert_store, reconciler_opts, watcher.clone(), shutdown.clone());

	{
		let watcher = watcher.clone();
		let supervisor_ready = supervisor_ready.clone();
		tokio::spawn(async move {
			watcher.ready().await;
			supervisor_ready.wait().await;
			info!("sidecar reconciled and ready");
		});
	}

	let result = supervisor.run(dirty_rx).await;

	if let Err(e) = std::fs::remove_dir_all(&run_dir) {
		warn!(error = %e, path = %run_dir.display(), "failed to remove scoped run directory");
	}

	result.map_err(anyhow::Error::from)
}

fn display(path: &Path) -> String {
	path.to_string_lossy().into_owned()
}
