//! Production `ProxySupervisor`: spawns the haproxy and dataplane-api
//! binaries as child processes and polls the management API's ping
//! endpoint until it answers, mirroring `haproxy/cmd.go`'s `runCommand`
//! and `haproxy_cmd/run.go`'s startup ping loop. Lives outside the core
//! per spec's Non-goals (§1); the supervisor depends only on the
//! `ProxySupervisor` trait.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::supervisor::{Error, ProxySupervisor};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Children {
	haproxy: Option<Child>,
	dataplane: Option<Child>,
}

/// Spawns `haproxy -f <cfg>` and the data-plane API daemon, and pings the
/// latter's `/v1/specification` endpoint (the same path
/// `haproxy/dataplane.go`'s `Ping` uses) until it responds.
#[derive(Clone)]
pub struct ProcessSupervisor {
	haproxy_bin: Arc<str>,
	haproxy_args: Arc<[String]>,
	dataplane_bin: Arc<str>,
	dataplane_args: Arc<[String]>,
	dataplane_base_url: Arc<str>,
	http: reqwest::Client,
	children: Arc<Mutex<Children>>,
}

impl ProcessSupervisor {
	pub fn new(
		haproxy_bin: impl Into<String>,
		haproxy_args: Vec<String>,
		dataplane_bin: impl Into<String>,
		dataplane_args: Vec<String>,
		dataplane_base_url: impl Into<String>,
	) -> Self {
		ProcessSupervisor {
			haproxy_bin: Arc::from(haproxy_bin.into()),
			haproxy_args: Arc::from(haproxy_args),
			dataplane_bin: Arc::from(dataplane_bin.into()),
			dataplane_args: Arc::from(dataplane_args),
			dataplane_base_url: Arc::from(dataplane_base_url.into()),
			http: reqwest::Client::builder()
				.timeout(PING_TIMEOUT)
				.build()
				.expect("static reqwest client configuration"),
			children: Arc::new(Mutex::new(Children::default())),
		}
	}

	fn spawn_one(bin: &str, args: &[String]) -> std::io::Result<Child> {
		Command::new(bin).args(args).stdin(Stdio::null()).kill_on_drop(false).spawn()
	}

	async fn spawn_impl(&self) -> Result<(), Error> {
		let haproxy = Self::spawn_one(&self.haproxy_bin, &self.haproxy_args)
			.map_err(|e| Error::Bootstrap(format!("spawning {}: {e}", self.haproxy_bin)))?;
		let dataplane = Self::spawn_one(&self.dataplane_bin, &self.dataplane_args)
			.map_err(|e| Error::Bootstrap(format!("spawning {}: {e}", self.dataplane_bin)))?;

		info!(
			haproxy_pid = haproxy.id(),
			dataplane_pid = dataplane.id(),
			"spawned proxy subprocesses"
		);

		let mut children = self.children.lock().await;
		children.haproxy = Some(haproxy);
		children.dataplane = Some(dataplane);
		Ok(())
	}

	async fn ping_impl(&self) -> Result<(), Error> {
		let url = format!("{}/v1/specification", self.dataplane_base_url);
		self.http
			.get(&url)
			.send()
			.await
			.and_then(reqwest::Response::error_for_status)
			.map(|_| ())
			.map_err(|e| Error::Bootstrap(e.to_string()))
	}

	async fn shutdown_one(name: &'static str, child: &mut Option<Child>) {
		let Some(mut proc) = child.take() else {
			return;
		};
		match proc.id() {
			Some(pid) => match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
				Ok(()) => {}
				Err(e) => {
					warn!(process = name, error = %e, "SIGTERM delivery failed, killing instead");
					let _ = proc.start_kill();
				}
			},
			None => {
				// Already reaped; `wait` below returns immediately.
			}
		}
		match proc.wait().await {
			Ok(status) => info!(process = name, %status, "subprocess exited"),
			Err(e) => warn!(process = name, error = %e, "error waiting for subprocess to exit"),
		}
	}

	async fn shutdown_impl(&self) -> Result<(), Error> {
		let mut children = self.children.lock().await;
		Self::shutdown_one("dataplane-api", &mut children.dataplane).await;
		Self::shutdown_one("haproxy", &mut children.haproxy).await;
		Ok(())
	}
}

impl ProxySupervisor for ProcessSupervisor {
	fn spawn(&self) -> BoxFuture<'static, Result<(), Error>> {
		let this = self.clone();
		Box::pin(async move { this.spawn_impl().await })
	}

	fn ping(&self) -> BoxFuture<'static, Result<(), Error>> {
		let this = self.clone();
		Box::pin(async move { this.ping_impl().await })
	}

	fn shutdown(&self) -> BoxFuture<'static, Result<(), Error>> {
		let this = self.clone();
		Box::pin(async move { this.shutdown_impl().await })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	// No real haproxy/dataplane-api binaries exist in the test
	// environment; this exercises only the ping path against a mock
	// management API.
	#[tokio::test]
	async fn ping_succeeds_against_the_specification_endpoint() {
		let server_mock = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1/specification"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server_mock)
			.await;

		let supervisor = ProcessSupervisor::new("haproxy", vec![], "dataplane-api", vec![], server_mock.uri());
		supervisor.ping_impl().await.unwrap();
	}

	#[tokio::test]
	async fn ping_fails_on_non_success_status() {
		let server_mock = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1/specification"))
			.respond_with(ResponseTemplate::new(503))
			.mount(&server_mock)
			.await;

		let supervisor = ProcessSupervisor::new("haproxy", vec![], "dataplane-api", vec![], server_mock.uri());
		assert!(supervisor.ping_impl().await.is_err());
	}

	#[tokio::test]
	async fn shutdown_with_no_spawned_children_is_a_noop() {
		let supervisor = ProcessSupervisor::new("haproxy", vec![], "dataplane-api", vec![], "http://127.0.0.1:1");
		supervisor.shutdown_impl().await.unwrap();
	}
}
