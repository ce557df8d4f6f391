//! Read-back (§4.E "Read-back"): reconstructs an `AppliedState` from the
//! live data plane's GET endpoints, for drift detection. Invariants that
//! the generator always satisfies (one bind per frontend, at most one
//! log target per parent, at most one filter per frontend paired with
//! exactly one TCP-request rule) are enforced here as programmer-error
//! checks (§7 "invariant violations... are aborted").

use crate::dataplane::DataplaneClient;

use super::state::{AppliedState, Backend, Frontend, FrontendFilter};
use super::Error;

async fn read_frontend(client: &DataplaneClient, name: &str) -> Result<Frontend, Error> {
	let model = client
		.list_frontends()
		.await?
		.into_iter()
		.find(|f| f.name == name)
		.expect("caller already confirmed this frontend exists");

	let mut binds = client.list_binds(name).await?;
	if binds.len() != 1 {
		return Err(Error::InvariantViolation(format!(
			"frontend {name} has {} binds, expected exactly 1",
			binds.len()
		)));
	}
	let bind = binds.remove(0);

	let log_targets = client.list_log_targets("frontend", name).await?;
	if log_targets.len() > 1 {
		return Err(Error::InvariantViolation(format!(
			"frontend {name} has {} log targets, expected at most 1",
			log_targets.len()
		)));
	}
	let log_target = log_targets.into_iter().next();

	let filters = client.list_filters(name).await?;
	if filters.len() > 1 {
		return Err(Error::InvariantViolation(format!(
			"frontend {name} has {} filters, expected at most 1",
			filters.len()
		)));
	}
	let filter = match filters.into_iter().next() {
		None => None,
		Some(filter) => {
			let mut rules = client.list_tcp_request_rules(name).await?;
			if rules.len() != 1 {
				return Err(Error::InvariantViolation(format!(
					"frontend {name} has a filter but {} tcp-request rules, expected exactly 1",
					rules.len()
				)));
			}
			Some(FrontendFilter { filter, tcp_request_rule: rules.remove(0) })
		}
	};

	Ok(Frontend { model, bind, log_target, filter })
}

async fn read_backend(client: &DataplaneClient, name: &str) -> Result<Backend, Error> {
	let model = client
		.list_backends()
		.await?
		.into_iter()
		.find(|b| b.name == name)
		.expect("caller already confirmed this backend exists");

	let servers = client.list_servers(name).await?;

	let log_targets = client.list_log_targets("backend", name).await?;
	if log_targets.len() > 1 {
		return Err(Error::InvariantViolation(format!(
			"backend {name} has {} log targets, expected at most 1",
			log_targets.len()
		)));
	}
	let log_target = log_targets.into_iter().next();

	let http_request_rules = client.list_http_request_rules(name).await?;

	Ok(Backend { model, servers, log_target, http_request_rules })
}

/// Reconstructs the live proxy's `AppliedState`, sorted the same way
/// `generate` sorts (§3 "lexicographic by name").
pub async fn read_back(client: &DataplaneClient) -> Result<AppliedState, Error> {
	let frontend_models = client.list_frontends().await?;
	let mut frontends = Vec::with_capacity(frontend_models.len());
	for model in &frontend_models {
		frontends.push(read_frontend(client, &model.name).await?);
	}

	let backend_models = client.list_backends().await?;
	let mut backends = Vec::with_capacity(backend_models.len());
	for model in &backend_models {
		backends.push(read_backend(client, &model.name).await?);
	}

	let mut state = AppliedState { frontends, backends };
	state.sort();
	Ok(state)
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	#[tokio::test]
	async fn two_binds_on_one_frontend_is_rejected() {
		let server_mock = MockServer::start().await;

		Mock::given(method("GET"))
			.and(path("/v1/services/haproxy/configuration/frontends"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
				{"name": "front_downstream", "mode": "http", "default_backend": "back_downstream", "client_timeout": 1000, "httplog": false}
			])))
			.mount(&server_mock)
			.await;

		Mock::given(method("GET"))
			.and(path("/v1/services/haproxy/configuration/binds"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
				{"name": "a", "address": "0.0.0.0", "port": 1, "ssl": false},
				{"name": "b", "address": "0.0.0.0", "port": 2, "ssl": false}
			])))
			.mount(&server_mock)
			.await;

		Mock::given(method("GET"))
			.and(path("/v1/services/haproxy/configuration/backends"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
			.mount(&server_mock)
			.await;

		let client = DataplaneClient::new(server_mock.uri(), None, None);
		let err = read_back(&client).await.unwrap_err();
		match err {
			Error::InvariantViolation(msg) => assert!(msg.contains("2 binds")),
			other => panic!("expected InvariantViolation, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn empty_proxy_reads_back_as_empty_state() {
		let server_mock = MockServer::start().await;

		Mock::given(method("GET"))
			.and(path("/v1/services/haproxy/configuration/frontends"))
			.respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
			.mount(&server_mock)
			.await;
		Mock::given(method("GET"))
			.and(path("/v1/services/haproxy/configuration/backends"))
			.respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
			.mount(&server_mock)
			.await;

		let client = DataplaneClient::new(server_mock.uri(), None, None);
		let state = read_back(&client).await.unwrap();
		assert_eq!(state, AppliedState::empty());
	}
}
