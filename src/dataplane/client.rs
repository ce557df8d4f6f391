//! The transactional REST client (§4.C): version tracking, lazy
//! transaction creation, and the non-transactional `replace_server`
//! fast path used for in-place server edits.

use std::time::Duration;

use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::model::{
	Backend, Bind, Filter, Frontend, HttpRequestRule, LogTarget, Server, TcpRequestRule, Transaction as TxResponse,
};
use super::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CONFIG_ROOT: &str = "/v1/services/haproxy/configuration";

struct State {
	version: u64,
}

pub struct DataplaneClient {
	http: reqwest::Client,
	base_url: String,
	auth: Option<(String, String)>,
	state: Mutex<State>,
	request_lock: Mutex<()>,
}

enum AfterHook {
	ReplaceServer { backend: String, name: String, server: Server },
}

/// A batch of structural mutations plus deferred `replace_server`
/// after-hooks (§4.C), committed together. Holds the client's
/// serialization lock for its whole lifetime so no versioned call can
/// interleave with an open transaction.
pub struct Transaction<'c> {
	client: &'c DataplaneClient,
	id: Option<String>,
	after: Vec<AfterHook>,
	_lock: MutexGuard<'c, ()>,
}

impl DataplaneClient {
	pub fn new(base_url: impl Into<String>, user: Option<String>, pass: Option<String>) -> Self {
		let http = reqwest::Client::builder()
			.timeout(REQUEST_TIMEOUT)
			.build()
			.expect("reqwest client builds");
		DataplaneClient {
			http,
			base_url: base_url.into(),
			auth: user.map(|u| (u, pass.unwrap_or_default())),
			state: Mutex::new(State { version: 1 }),
			request_lock: Mutex::new(()),
		}
	}

	pub async fn version(&self) -> u64 {
		self.state.lock().await.version
	}

	/// Starts a transaction. The transaction is created server-side lazily,
	/// on the first mutation (§4.C).
	pub async fn begin(&self) -> Transaction<'_> {
		let lock = self.request_lock.lock().await;
		Transaction { client: self, id: None, after: Vec::new(), _lock: lock }
	}

	async fn ensure_tx_id(&self, tx: &mut Transaction<'_>) -> Result<String, Error> {
		if let Some(id) = &tx.id {
			return Ok(id.clone());
		}
		let version = self.state.lock().await.version;
		let url = format!("{}/v1/services/haproxy/transactions?version={version}", self.base_url);
		let mut req = self.http.post(&url);
		if let Some((user, pass)) = &self.auth {
			req = req.basic_auth(user, Some(pass));
		}
		let resp = req.send().await?;
		let status = resp.status();
		if status.as_u16() >= 400 {
			let body = resp.text().await.unwrap_or_default();
			return Err(Error::Status { status: status.as_u16(), body });
		}
		let resp: TxResponse = resp.json().await?;
		debug!(tx_id = %resp.id, version, "opened data-plane transaction");
		tx.id = Some(resp.id.clone());
		Ok(resp.id)
	}

	async fn send_no_body<B: Serialize>(&self, method: Method, url: &str, body: &B) -> Result<(), Error> {
		let mut req = self.http.request(method, url).json(body);
		if let Some((user, pass)) = &self.auth {
			req = req.basic_auth(user, Some(pass));
		}
		let resp = req.send().await?;
		let status = resp.status();
		if status.as_u16() >= 400 {
			let body = resp.text().await.unwrap_or_default();
			return Err(Error::Status { status: status.as_u16(), body });
		}
		Ok(())
	}

	async fn delete(&self, url: &str) -> Result<(), Error> {
		let mut req = self.http.request(Method::DELETE, url);
		if let Some((user, pass)) = &self.auth {
			req = req.basic_auth(user, Some(pass));
		}
		let resp = req.send().await?;
		let status = resp.status();
		if status.as_u16() >= 400 {
			let body = resp.text().await.unwrap_or_default();
			return Err(Error::Status { status: status.as_u16(), body });
		}
		Ok(())
	}

	async fn get<R: DeserializeOwned>(&self, url: &str) -> Result<R, Error> {
		let mut req = self.http.get(url);
		if let Some((user, pass)) = &self.auth {
			req = req.basic_auth(user, Some(pass));
		}
		let resp = req.send().await?;
		let status = resp.status();
		if status.as_u16() >= 400 {
			let body = resp.text().await.unwrap_or_default();
			return Err(Error::Status { status: status.as_u16(), body });
		}
		Ok(resp.json().await?)
	}

	fn tx_query(tx_id: &str) -> String {
		format!("transaction_id={tx_id}")
	}

	pub async fn create_frontend(&self, tx: &mut Transaction<'_>, frontend: &Frontend) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!("{}{CONFIG_ROOT}/frontends?{}", self.base_url, Self::tx_query(&tx_id));
		self.send_no_body(Method::POST, &url, frontend).await
	}

	pub async fn delete_frontend(&self, tx: &mut Transaction<'_>, name: &str) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!("{}{CONFIG_ROOT}/frontends/{name}?{}", self.base_url, Self::tx_query(&tx_id));
		self.delete(&url).await
	}

	pub async fn create_bind(&self, tx: &mut Transaction<'_>, frontend: &str, bind: &Bind) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!(
			"{}{CONFIG_ROOT}/binds?frontend={frontend}&{}",
			self.base_url,
			Self::tx_query(&tx_id)
		);
		self.send_no_body(Method::POST, &url, bind).await
	}

	pub async fn create_backend(&self, tx: &mut Transaction<'_>, backend: &Backend) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!("{}{CONFIG_ROOT}/backends?{}", self.base_url, Self::tx_query(&tx_id));
		self.send_no_body(Method::POST, &url, backend).await
	}

	pub async fn delete_backend(&self, tx: &mut Transaction<'_>, name: &str) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!("{}{CONFIG_ROOT}/backends/{name}?{}", self.base_url, Self::tx_query(&tx_id));
		self.delete(&url).await
	}

	pub async fn create_server(&self, tx: &mut Transaction<'_>, backend: &str, server: &Server) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!(
			"{}{CONFIG_ROOT}/servers?backend={backend}&{}",
			self.base_url,
			Self::tx_query(&tx_id)
		);
		self.send_no_body(Method::POST, &url, server).await
	}

	pub async fn delete_server(&self, tx: &mut Transaction<'_>, backend: &str, name: &str) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!(
			"{}{CONFIG_ROOT}/servers/{name}?backend={backend}&{}",
			self.base_url,
			Self::tx_query(&tx_id)
		);
		self.delete(&url).await
	}

	pub async fn create_filter(&self, tx: &mut Transaction<'_>, parent: &str, filter: &Filter) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!(
			"{}{CONFIG_ROOT}/filters?parent_type=frontend&parent_name={parent}&{}",
			self.base_url,
			Self::tx_query(&tx_id)
		);
		self.send_no_body(Method::POST, &url, filter).await
	}

	pub async fn create_tcp_request_rule(
		&self,
		tx: &mut Transaction<'_>,
		parent: &str,
		rule: &TcpRequestRule,
	) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!(
			"{}{CONFIG_ROOT}/tcp_request_rules?parent_type=frontend&parent_name={parent}&{}",
			self.base_url,
			Self::tx_query(&tx_id)
		);
		self.send_no_body(Method::POST, &url, rule).await
	}

	pub async fn create_http_request_rule(
		&self,
		tx: &mut Transaction<'_>,
		parent: &str,
		rule: &HttpRequestRule,
	) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!(
			"{}{CONFIG_ROOT}/http_request_rules?parent_type=backend&parent_name={parent}&{}",
			self.base_url,
			Self::tx_query(&tx_id)
		);
		self.send_no_body(Method::POST, &url, rule).await
	}

	pub async fn create_log_target(
		&self,
		tx: &mut Transaction<'_>,
		parent_type: &str,
		parent: &str,
		target: &LogTarget,
	) -> Result<(), Error> {
		let tx_id = self.ensure_tx_id(tx).await?;
		let url = format!(
			"{}{CONFIG_ROOT}/log_targets?parent_type={parent_type}&parent_name={parent}&{}",
			self.base_url,
			Self::tx_query(&tx_id)
		);
		self.send_no_body(Method::POST, &url, target).await
	}

	/// Registers a `replace_server` call to run after this transaction
	/// commits (§4.C). Used for the slot-table hot path, which must not
	/// provoke a reload.
	pub fn defer_replace_server(tx: &mut Transaction<'_>, backend: impl Into<String>, name: impl Into<String>, server: Server) {
		tx.after.push(AfterHook::ReplaceServer { backend: backend.into(), name: name.into(), server });
	}

	/// Commits the transaction, bumps `version` on success, then runs its
	/// deferred after-hooks in FIFO order.
	pub async fn commit(&self, tx: Transaction<'_>) -> Result<(), Error> {
		let Transaction { client, id, after, _lock } = tx;
		if let Some(tx_id) = id {
			let version = client.state.lock().await.version;
			let url = format!(
				"{}/v1/services/haproxy/transactions/{tx_id}?version={version}",
				client.base_url
			);
			client.send_no_body(Method::PUT, &url, &()).await?;
			client.state.lock().await.version += 1;
		}
		for hook in after {
			match hook {
				AfterHook::ReplaceServer { backend, name, server } => {
					client.replace_server_locked(&backend, &name, &server).await?;
				}
			}
		}
		Ok(())
	}

	/// The non-transactional `replace_server` path (§4.C): applied
	/// directly, still bumps `version`, serialized against any open
	/// transaction via the client's request lock.
	pub async fn replace_server(&self, backend: &str, name: &str, server: &Server) -> Result<(), Error> {
		let _lock = self.request_lock.lock().await;
		self.replace_server_locked(backend, name, server).await
	}

	async fn replace_server_locked(&self, backend: &str, name: &str, server: &Server) -> Result<(), Error> {
		let version = self.state.lock().await.version;
		let url = format!(
			"{}{CONFIG_ROOT}/servers/{name}?backend={backend}&version={version}",
			self.base_url
		);
		self.send_no_body(Method::PUT, &url, server).await?;
		self.state.lock().await.version += 1;
		Ok(())
	}

	// Read-back (§4.E "Read-back"): version-less GETs.

	pub async fn list_frontends(&self) -> Result<Vec<Frontend>, Error> {
		let url = format!("{}{CONFIG_ROOT}/frontends", self.base_url);
		self.get(&url).await
	}

	pub async fn list_binds(&self, frontend: &str) -> Result<Vec<Bind>, Error> {
		let url = format!("{}{CONFIG_ROOT}/binds?frontend={frontend}", self.base_url);
		self.get(&url).await
	}

	pub async fn list_backends(&self) -> Result<Vec<Backend>, Error> {
		let url = format!("{}{CONFIG_ROOT}/backends", self.base_url);
		self.get(&url).await
	}

	pub async fn list_servers(&self, backend: &str) -> Result<Vec<Server>, Error> {
		let url = format!("{}{CONFIG_ROOT}/servers?backend={backend}", self.base_url);
		self.get(&url).await
	}

	pub async fn list_log_targets(&self, parent_type: &str, parent: &str) -> Result<Vec<LogTarget>, Error> {
		let url = format!(
			"{}{CONFIG_ROOT}/log_targets?parent_type={parent_type}&parent_name={parent}",
			self.base_url
		);
		self.get(&url).await
	}

	pub async fn list_filters(&self, parent: &str) -> Result<Vec<Filter>, Error> {
		let url = format!(
			"{}{CONFIG_ROOT}/filters?parent_type=frontend&parent_name={parent}",
			self.base_url
		);
		self.get(&url).await
	}

	pub async fn list_tcp_request_rules(&self, parent: &str) -> Result<Vec<TcpRequestRule>, Error> {
		let url = format!(
			"{}{CONFIG_ROOT}/tcp_request_rules?parent_type=frontend&parent_name={parent}",
			self.base_url
		);
		self.get(&url).await
	}

	pub async fn list_http_request_rules(&self, parent: &str) -> Result<Vec<HttpRequestRule>, Error> {
		let url = format!(
			"{}{CONFIG_ROOT}/http_request_rules?parent_type=backend&parent_name={parent}",
			self.base_url
		);
		self.get(&url).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dataplane::model::{Maintenance, Mode};
	use wiremock::matchers::{method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn frontend(name: &str) -> Frontend {
		Frontend { name: name.to_string(), mode: Mode::Http, default_backend: "back".into(), client_timeout: 1000, httplog: false }
	}

	fn server(name: &str) -> Server {
		Server {
			name: name.to_string(),
			address: "127.0.0.1".into(),
			port: 1,
			weight: 1,
			ssl: None,
			ssl_certificate: None,
			ssl_cafile: None,
			verify: None,
			maintenance: Maintenance::Disabled,
		}
	}

	#[tokio::test]
	async fn begin_creates_transaction_lazily_and_commit_bumps_version() {
		let server_mock = MockServer::start().await;

		Mock::given(method("POST"))
			.and(path("/v1/services/haproxy/transactions"))
			.and(query_param("version", "1"))
			.respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "tx-1"})))
			.expect(1)
			.mount(&server_mock)
			.await;

		Mock::given(method("POST"))
			.and(path("/v1/services/haproxy/configuration/frontends"))
			.and(query_param("transaction_id", "tx-1"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server_mock)
			.await;

		Mock::given(method("PUT"))
			.and(path("/v1/services/haproxy/transactions/tx-1"))
			.and(query_param("version", "1"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server_mock)
			.await;

		let client = DataplaneClient::new(server_mock.uri(), None, None);
		assert_eq!(client.version().await, 1);

		let mut tx = client.begin().await;
		client.create_frontend(&mut tx, &frontend("front_downstream")).await.unwrap();
		client.commit(tx).await.unwrap();

		assert_eq!(client.version().await, 2);
	}

	#[tokio::test]
	async fn replace_server_bumps_version_without_a_transaction() {
		let server_mock = MockServer::start().await;

		Mock::given(method("PUT"))
			.and(path("/v1/services/haproxy/configuration/servers/srv_0"))
			.and(query_param("backend", "back_service_server"))
			.and(query_param("version", "1"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server_mock)
			.await;

		let client = DataplaneClient::new(server_mock.uri(), None, None);
		client.replace_server("back_service_server", "srv_0", &server("srv_0")).await.unwrap();
		assert_eq!(client.version().await, 2);
	}

	#[tokio::test]
	async fn error_status_includes_response_body_verbatim() {
		let server_mock = MockServer::start().await;

		Mock::given(method("POST"))
			.and(path("/v1/services/haproxy/transactions"))
			.respond_with(ResponseTemplate::new(500).set_body_string("backend busy"))
			.mount(&server_mock)
			.await;

		let client = DataplaneClient::new(server_mock.uri(), None, None);
		let mut tx = client.begin().await;
		let err = client.create_frontend(&mut tx, &frontend("front_downstream")).await.unwrap_err();
		match err {
			Error::Status { status, body } => {
				assert_eq!(status, 500);
				assert_eq!(body, "backend busy");
			}
			other => panic!("expected Status error, got {other:?}"),
		}
	}
}
