//! The supervisor / event loop (§4.G): the sole mutator of `AppliedState`.
//! Drives generate/apply/commit passes from a throttled, coalesced stream
//! of dirty signals, a periodic drift-resync tick, and a retry timer,
//! mirroring `haproxy/state.go`'s `watch` loop.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cert_store::CertStore;
use crate::dataplane::DataplaneClient;
use crate::reconciler::{self, AppliedState, Options};
use crate::watch::ready::ReadyBarrier;
use crate::watch::Watcher;

const THROTTLE: Duration = Duration::from_millis(500);
const RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
const RETRY_BACKOFF: Duration = Duration::from_secs(3);
const BOOTSTRAP_PING_BUDGET: Duration = Duration::from_secs(5);
const BOOTSTRAP_PING_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Reconciler(#[from] reconciler::Error),
	#[error("proxy bootstrap failed: {0}")]
	Bootstrap(String),
}

/// Abstracts "bootstrap the proxy via the external supervisor" (§4.G
/// step 2) so the reconcile loop never depends on how the proxy and its
/// management daemon are actually launched. The production
/// implementation lives in `process::ProcessSupervisor`; tests use a
/// fake that is immediately ready.
pub trait ProxySupervisor: Send + Sync + 'static {
	fn spawn(&self) -> BoxFuture<'static, Result<(), Error>>;
	fn ping(&self) -> BoxFuture<'static, Result<(), Error>>;
	fn shutdown(&self) -> BoxFuture<'static, Result<(), Error>>;
}

/// Drives one reconcile pass after another until cancelled. Holds the
/// only mutable handle to `current_applied` (§5 "the supervisor thread
/// is the sole mutator of `AppliedState`").
pub struct Supervisor {
	proxy: Arc<dyn ProxySupervisor>,
	dataplane: DataplaneClient,
	cert_store: CertStore,
	opts: Options,
	watcher: Arc<Watcher>,
	shutdown: CancellationToken,
	ready: Arc<ReadyBarrier>,
}

impl Supervisor {
	/// Returns the supervisor and a barrier that fires once, after the
	/// first successful reconcile pass (§4.G: "the first successful
	/// reconcile closes the readiness channel").
	pub fn new(
		proxy: Arc<dyn ProxySupervisor>,
		dataplane: DataplaneClient,
		cert_store: CertStore,
		opts: Options,
		watcher: Arc<Watcher>,
		shutdown: CancellationToken,
	) -> (Self, Arc<ReadyBarrier>) {
		let ready = Arc::new(ReadyBarrier::new(1));
		let supervisor = Supervisor {
			proxy,
			dataplane,
			cert_store,
			opts,
			watcher,
			shutdown,
			ready: ready.clone(),
		};
		(supervisor, ready)
	}

	async fn bootstrap(&self) -> Result<(), Error> {
		self.proxy.spawn().await?;

		let deadline = tokio::time::Instant::now() + BOOTSTRAP_PING_BUDGET;
		loop {
			if self.proxy.ping().await.is_ok() {
				return Ok(());
			}
			if tokio::time::Instant::now() >= deadline {
				return Err(Error::Bootstrap(
					"proxy management endpoint did not answer its ping within the startup budget".to_string(),
				));
			}
			tokio::time::sleep(BOOTSTRAP_PING_INTERVAL).await;
		}
	}

	fn schedule_retry(retry_tx: &mpsc::Sender<()>) {
		let retry_tx = retry_tx.clone();
		tokio::spawn(async move {
			tokio::time::sleep(RETRY_BACKOFF).await;
			let _ = retry_tx.try_send(());
		});
	}

	/// Runs the event loop to completion: either the shutdown token fires
	/// (proxy is asked to shut down, loop returns `Ok`), or bootstrap
	/// fails fatally (loop returns `Err`, which the caller should treat as
	/// cause for full process shutdown per §7 "subprocess exit").
	pub async fn run(self, mut dirty_rx: mpsc::Receiver<()>) -> Result<(), Error> {
		let mut throttle = tokio::time::interval(THROTTLE);
		throttle.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut resync = tokio::time::interval(RESYNC_INTERVAL);
		resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let (retry_tx, mut retry_rx) = mpsc::channel::<()>(1);

		let mut current_applied = AppliedState::empty();
		let mut dirty = false;
		let mut started = false;
		let mut ready_signalled = false;

		loop {
			let mut input_received = false;
			loop {
				tokio::select! {
					biased;

					_ = self.shutdown.cancelled() => {
						info!("shutdown requested, stopping proxy");
						if let Err(e) = self.proxy.shutdown().await {
							warn!(error = %e, "error shutting down proxy");
						}
						return Ok(());
					}
					_ = throttle.tick() => {
						if input_received {
							break;
						}
					}
					Some(()) = dirty_rx.recv() => {
						debug!("new desired configuration observed");
						input_received = true;
					}
					_ = resync.tick() => {
						info!("periodic drift resync check");
						dirty = true;
						input_received = true;
					}
					Some(()) = retry_rx.recv() => {
						warn!("retrying previously failed apply");
						dirty = true;
						input_received = true;
					}
				}
			}

			if !started {
				if let Err(e) = self.bootstrap().await {
					error!(error = %e, "proxy failed to start, exiting");
					return Err(e);
				}
				started = true;
			}

			if dirty {
				match reconciler::read_back(&self.dataplane).await {
					Ok(from_proxy) => {
						if from_proxy != current_applied {
							warn!("drift detected between expected and live proxy state");
						}
						current_applied = from_proxy;
						dirty = false;
					}
					Err(e) => {
						error!(error = %e, "error reading back live proxy state");
						Self::schedule_retry(&retry_tx);
						continue;
					}
				}
			}

			let Some(desired) = self.watcher.desired_config().await else {
				continue;
			};

			let next = match reconciler::generate(&self.opts, &self.cert_store, &current_applied, &desired) {
				Ok(next) => next,
				Err(e) => {
					error!(error = %e, "failed to generate next state");
					continue;
				}
			};

			if next == current_applied {
				debug!("no change to apply to the proxy");
				if !ready_signalled {
					self.ready.arrive();
					ready_signalled = true;
				}
				continue;
			}

			match reconciler::apply(&self.dataplane, &current_applied, &next).await {
				Ok(()) => {
					current_applied = next;
					if !ready_signalled {
						self.ready.arrive();
						ready_signalled = true;
					}
					info!("state applied");
				}
				Err(e) => {
					error!(error = %e, "failed to apply new state");
					dirty = true;
					Self::schedule_retry(&retry_tx);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mesh::MeshClient;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration as StdDuration;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	struct FakeProxy {
		spawns: AtomicUsize,
		pings: AtomicUsize,
		shutdowns: AtomicUsize,
	}

	impl FakeProxy {
		fn new() -> Arc<Self> {
			Arc::new(FakeProxy {
				spawns: AtomicUsize::new(0),
				pings: AtomicUsize::new(0),
				shutdowns: AtomicUsize::new(0),
			})
		}
	}

	impl ProxySupervisor for FakeProxy {
		fn spawn(&self) -> BoxFuture<'static, Result<(), Error>> {
			self.spawns.fetch_add(1, Ordering::SeqCst);
			Box::pin(async { Ok(()) })
		}
		fn ping(&self) -> BoxFuture<'static, Result<(), Error>> {
			self.pings.fetch_add(1, Ordering::SeqCst);
			Box::pin(async { Ok(()) })
		}
		fn shutdown(&self) -> BoxFuture<'static, Result<(), Error>> {
			self.shutdowns.fetch_add(1, Ordering::SeqCst);
			Box::pin(async { Ok(()) })
		}
	}

	fn store() -> CertStore {
		let mut dir = std::env::temp_dir();
		dir.push(format!("connect-sidecar-supervisor-test-{}-{:?}", std::process::id(), std::time::Instant::now()));
		CertStore::new(dir).unwrap()
	}

	fn opts() -> Options {
		Options {
			enable_intentions: false,
			log_requests: false,
			log_socket: None,
			spoe_config_path: "/run/spoe.conf".into(),
			authz_agent_socket: "/run/spoe.sock".into(),
		}
	}

	// No desired config is ever produced (the watcher's subscriptions
	// were never started), so once a dirty tick kicks the loop out of
	// coalescing, it should bootstrap the proxy exactly once, see no
	// desired config, and idle until shutdown asks the proxy to stop.
	#[tokio::test]
	async fn bootstraps_once_and_shuts_down_the_proxy_on_cancellation() {
		let server_mock = MockServer::start().await;
		let dataplane = DataplaneClient::new(server_mock.uri(), None, None);
		let cert_store = store();
		let shutdown = CancellationToken::new();
		let mesh = MeshClient::new("http://127.0.0.1:1", None);
		let (watcher, _unused_rx) = Watcher::new(mesh, "web".to_string(), shutdown.clone());
		let watcher = Arc::new(watcher);
		let proxy = FakeProxy::new();

		let (dirty_tx, dirty_rx) = mpsc::channel(1);
		let (supervisor, ready) = Supervisor::new(proxy.clone(), dataplane, cert_store, opts(), watcher, shutdown.clone());

		let handle = tokio::spawn(supervisor.run(dirty_rx));
		let _ = dirty_tx.send(()).await;

		assert!(tokio::time::timeout(StdDuration::from_secs(1), ready.wait()).await.is_err());
		assert_eq!(proxy.spawns.load(Ordering::SeqCst), 1);

		shutdown.cancel();
		let result = tokio::time::timeout(StdDuration::from_secs(1), handle).await.unwrap().unwrap();
		assert!(result.is_ok());
		assert_eq!(proxy.shutdowns.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn bootstrap_failure_returns_err_without_spinning() {
		struct NeverReady;
		impl ProxySupervisor for NeverReady {
			fn spawn(&self) -> BoxFuture<'static, Result<(), Error>> {
				Box::pin(async { Ok(()) })
			}
			fn ping(&self) -> BoxFuture<'static, Result<(), Error>> {
				Box::pin(async { Err(Error::Bootstrap("connection refused".to_string())) })
			}
			fn shutdown(&self) -> BoxFuture<'static, Result<(), Error>> {
				Box::pin(async { Ok(()) })
			}
		}

		let server_mock = MockServer::start().await;
		Mock::given(method("GET")).and(path("/v1/specification")).respond_with(ResponseTemplate::new(500)).mount(&server_mock).await;
		let dataplane = DataplaneClient::new(server_mock.uri(), None, None);
		let cert_store = store();
		let shutdown = CancellationToken::new();
		let mesh = MeshClient::new("http://127.0.0.1:1", None);
		let (watcher, _unused_rx) = Watcher::new(mesh, "web".to_string(), shutdown.clone());
		let watcher = Arc::new(watcher);

		let (dirty_tx, dirty_rx) = mpsc::channel(1);
		let (supervisor, _ready) = Supervisor::new(Arc::new(NeverReady), dataplane, cert_store, opts(), watcher, shutdown.clone());

		let _ = dirty_tx.send(()).await;
		let result = tokio::time::timeout(StdDuration::from_secs(10), supervisor.run(dirty_rx)).await.unwrap();
		assert!(matches!(result, Err(Error::Bootstrap(_))));
	}
}
