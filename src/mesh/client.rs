use std::time::Duration;

use reqwest::header::HeaderMap;

use super::model::{
	AgentService, AuthorizeRequest, AuthorizeResponse, CaRootList, LeafCert, PreparedQueryExecuteResponse,
	QueryMeta, ServiceEntry,
};
use super::Error;

/// Subscription blocking queries use a 10 minute wait, per spec.md §5.
pub const BLOCKING_WAIT: Duration = Duration::from_secs(10 * 60);

const INDEX_HEADER: &str = "X-Consul-Index";
const CONTENT_HASH_HEADER: &str = "X-Consul-Contenthash";

/// Thin HTTP client over the mesh agent's API. Cloning is cheap: it
/// shares the underlying `reqwest::Client` connection pool.
#[derive(Clone)]
pub struct MeshClient {
	base_url: String,
	token: Option<String>,
	http: reqwest::Client,
}

impl MeshClient {
	pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
		MeshClient {
			base_url: base_url.into(),
			token,
			http: reqwest::Client::builder()
				.timeout(BLOCKING_WAIT + Duration::from_secs(30))
				.build()
				.expect("reqwest client"),
		}
	}

	fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
		let mut req = self.http.request(method, format!("{}{}", self.base_url, path));
		if let Some(token) = &self.token {
			req = req.header("X-Consul-Token", token);
		}
		req
	}

	async fn blocking_get<T: serde::de::DeserializeOwned>(
		&self,
		path: &str,
		query: &[(&str, String)],
	) -> Result<(T, QueryMeta), Error> {
		let mut req = self.request(reqwest::Method::GET, path).query(query);
		req = req.query(&[("wait", format!("{}s", BLOCKING_WAIT.as_secs()))]);

		let res = req.send().await?;
		let status = res.status();
		let headers = res.headers().clone();
		if !status.is_success() {
			let body = res.text().await.unwrap_or_default();
			return Err(Error::Status { status: status.as_u16(), body });
		}
		let meta = query_meta(&headers);
		let body = res.json::<T>().await?;
		Ok((body, meta))
	}

	/// Blocking query for the mesh's CA trust roots.
	pub async fn ca_roots(&self, wait_index: u64) -> Result<(CaRootList, QueryMeta), Error> {
		self.blocking_get("/v1/agent/connect/ca/roots", &[("index", wait_index.to_string())])
			.await
	}

	/// Blocking query for the local service's leaf certificate.
	pub async fn leaf_cert(&self, service_name: &str, wait_index: u64) -> Result<(LeafCert, QueryMeta), Error> {
		self.blocking_get(
			&format!("/v1/agent/connect/ca/leaf/{service_name}"),
			&[("index", wait_index.to_string())],
		)
		.await
	}

	/// Content-hash blocking query for a registered agent service (used
	/// for both the local service and the sidecar proxy service).
	pub async fn agent_service(&self, service_id: &str, wait_hash: &str) -> Result<(AgentService, QueryMeta), Error> {
		self.blocking_get(
			&format!("/v1/agent/service/{service_id}"),
			&[("hash", wait_hash.to_string())],
		)
		.await
	}

	/// Blocking query against connect-enabled health checks for a
	/// destination service, used for `Service` upstreams.
	pub async fn connect_health(
		&self,
		destination_name: &str,
		datacenter: &str,
		wait_index: u64,
	) -> Result<(Vec<ServiceEntry>, QueryMeta), Error> {
		let mut query = vec![("index", wait_index.to_string())];
		if !datacenter.is_empty() {
			query.push(("dc", datacenter.to_string()));
		}
		self.blocking_get(&format!("/v1/health/connect/{destination_name}"), &query)
			.await
	}

	/// Polled (non-blocking) prepared-query execution, used for
	/// `PreparedQuery` upstreams. §4.F: the mesh exposes no blocking mode
	/// for this endpoint.
	pub async fn prepared_query_execute(
		&self,
		query_name: &str,
		datacenter: &str,
	) -> Result<PreparedQueryExecuteResponse, Error> {
		let mut query = Vec::new();
		if !datacenter.is_empty() {
			query.push(("dc", datacenter.to_string()));
		}
		let res = self
			.request(reqwest::Method::GET, &format!("/v1/query/{query_name}/execute"))
			.query(&query)
			.send()
			.await?;
		let status = res.status();
		if !status.is_success() {
			let body = res.text().await.unwrap_or_default();
			return Err(Error::Status { status: status.as_u16(), body });
		}
		Ok(res.json().await?)
	}

	/// Resolves `service_id`'s sidecar connect-proxy service id by
	/// scanning the agent's locally registered services.
	pub async fn lookup_proxy_id_for_sidecar(&self, service_id: &str) -> Result<String, Error> {
		let services: std::collections::HashMap<String, AgentService> = self
			.request(reqwest::Method::GET, "/v1/agent/services")
			.send()
			.await?
			.json()
			.await?;

		services
			.into_values()
			.find(|svc| {
				svc.kind == "connect-proxy"
					&& svc
						.proxy
						.as_ref()
						.map(|p| p.destination_service_id == service_id)
						.unwrap_or(false)
			})
			.map(|svc| svc.id)
			.ok_or_else(|| Error::ProxyNotFound(service_id.to_string()))
	}

	/// Asks the mesh agent whether `client_cert_uri` may call this
	/// service. The authorization-agent's single-flight cache is the
	/// caller's responsibility; this is the bare RPC.
	pub async fn authorize(&self, req: AuthorizeRequest) -> Result<bool, Error> {
		let res = self
			.request(reqwest::Method::POST, "/v1/agent/connect/authorize")
			.json(&req)
			.send()
			.await?;
		let status = res.status();
		if !status.is_success() {
			let body = res.text().await.unwrap_or_default();
			return Err(Error::Status { status: status.as_u16(), body });
		}
		let body: AuthorizeResponse = res.json().await?;
		Ok(body.authorized)
	}
}

fn query_meta(headers: &HeaderMap) -> QueryMeta {
	let last_index = headers
		.get(INDEX_HEADER)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse().ok())
		.unwrap_or(0);
	let last_content_hash = headers
		.get(CONTENT_HASH_HEADER)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.to_string();
	QueryMeta { last_index, last_content_hash }
}
