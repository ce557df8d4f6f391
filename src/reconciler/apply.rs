//! The apply algorithm (§4.E "Apply algorithm"): translates the diff
//! between two `AppliedState`s into the minimum set of data-plane
//! mutations, batched into one transaction with `replace_server` deferred
//! as post-commit after-hooks.

use std::collections::HashMap;

use crate::dataplane::{DataplaneClient, Error as DataplaneError};

use super::state::{AppliedState, Backend, Frontend};
use super::Error;

fn index_by_name<'a, T>(items: &'a [T], name: impl Fn(&T) -> &str) -> HashMap<&'a str, usize> {
	items.iter().enumerate().map(|(i, item)| (name(item), i)).collect()
}

async fn apply_frontends<'c>(
	client: &'c DataplaneClient,
	tx: &mut crate::dataplane::Transaction<'c>,
	old: &[Frontend],
	new: &[Frontend],
) -> Result<(), DataplaneError> {
	let old_idx = index_by_name(old, |f| f.model.name.as_str());
	let new_idx = index_by_name(new, |f| f.model.name.as_str());

	for frontend in old {
		if !new_idx.contains_key(frontend.model.name.as_str()) {
			client.delete_frontend(tx, &frontend.model.name).await?;
		}
	}

	for frontend in new {
		if let Some(&old_i) = old_idx.get(frontend.model.name.as_str()) {
			if &old[old_i] == frontend {
				continue;
			}
			client.delete_frontend(tx, &frontend.model.name).await?;
		}

		client.create_frontend(tx, &frontend.model).await?;
		client.create_bind(tx, &frontend.model.name, &frontend.bind).await?;

		if let Some(log_target) = &frontend.log_target {
			client.create_log_target(tx, "frontend", &frontend.model.name, log_target).await?;
		}

		if let Some(filter) = &frontend.filter {
			client.create_filter(tx, &frontend.model.name, &filter.filter).await?;
			client
				.create_tcp_request_rule(tx, &frontend.model.name, &filter.tcp_request_rule)
				.await?;
		}
	}

	Ok(())
}

fn should_recreate_backend(old: &Backend, new: &Backend) -> bool {
	old.model != new.model || old.log_target != new.log_target || old.servers.len() != new.servers.len()
}

async fn apply_backends<'c>(
	client: &'c DataplaneClient,
	tx: &mut crate::dataplane::Transaction<'c>,
	old: &[Backend],
	new: &[Backend],
) -> Result<(), DataplaneError> {
	let old_idx = index_by_name(old, |b| b.model.name.as_str());
	let new_idx = index_by_name(new, |b| b.model.name.as_str());

	for backend in old {
		if !new_idx.contains_key(backend.model.name.as_str()) {
			client.delete_backend(tx, &backend.model.name).await?;
		}
	}

	for backend in new {
		let mut recreated = true;
		let mut old_servers: &[crate::dataplane::model::Server] = &[];

		if let Some(&old_i) = old_idx.get(backend.model.name.as_str()) {
			let old_backend = &old[old_i];
			if should_recreate_backend(old_backend, backend) {
				client.delete_backend(tx, &backend.model.name).await?;
			} else {
				recreated = false;
				old_servers = &old_backend.servers;
			}
		}

		if recreated {
			client.create_backend(tx, &backend.model).await?;
			if let Some(log_target) = &backend.log_target {
				client.create_log_target(tx, "backend", &backend.model.name, log_target).await?;
			}
			for rule in &backend.http_request_rules {
				client.create_http_request_rule(tx, &backend.model.name, rule).await?;
			}
			for server in &backend.servers {
				client.create_server(tx, &backend.model.name, server).await?;
			}
		} else {
			for (i, server) in backend.servers.iter().enumerate() {
				if old_servers.get(i) == Some(server) {
					continue;
				}
				DataplaneClient::defer_replace_server(tx, backend.model.name.clone(), server.name.clone(), server.clone());
			}
		}
	}

	Ok(())
}

/// Applies the diff from `prev` to `next` as one transaction: all
/// frontend mutations precede all backend mutations; within each,
/// deletes precede creates; `replace_server` runs as a deferred
/// after-hook so the hot path of node churn never opens a transaction
/// that would provoke a reload.
pub async fn apply(client: &DataplaneClient, prev: &AppliedState, next: &AppliedState) -> Result<(), Error> {
	let mut tx = client.begin().await;
	apply_frontends(client, &mut tx, &prev.frontends, &next.frontends).await?;
	apply_backends(client, &mut tx, &prev.backends, &next.backends).await?;
	client.commit(tx).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dataplane::model::{Backend as BackendModel, Maintenance, Mode, Server};
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn backend_with_servers(name: &str, connect_timeout: Option<i64>, servers: Vec<Server>) -> Backend {
		Backend {
			model: BackendModel {
				name: name.to_string(),
				mode: Mode::Http,
				connect_timeout,
				server_timeout: None,
				balance: None,
				forwardfor: None,
			},
			servers,
			log_target: None,
			http_request_rules: Vec::new(),
		}
	}

	fn server(name: &str, address: &str, port: i64, maintenance: Maintenance) -> Server {
		Server {
			name: name.to_string(),
			address: address.to_string(),
			port,
			weight: 1,
			ssl: None,
			ssl_certificate: None,
			ssl_cafile: None,
			verify: None,
			maintenance,
		}
	}

	async fn mount_transaction(server_mock: &MockServer) {
		Mock::given(method("POST"))
			.and(path("/v1/services/haproxy/transactions"))
			.respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "tx-1"})))
			.mount(server_mock)
			.await;
		Mock::given(method("PUT"))
			.and(path("/v1/services/haproxy/transactions/tx-1"))
			.respond_with(ResponseTemplate::new(200))
			.mount(server_mock)
			.await;
	}

	// S2/invariant 2 — node removal replaces a server in place; the
	// backend itself is never deleted or recreated.
	#[tokio::test]
	async fn node_churn_never_deletes_or_recreates_the_backend() {
		let server_mock = MockServer::start().await;
		mount_transaction(&server_mock).await;

		Mock::given(method("DELETE"))
			.and(path("/v1/services/haproxy/configuration/backends/back_service_server"))
			.expect(0)
			.mount(&server_mock)
			.await;
		Mock::given(method("POST"))
			.and(path("/v1/services/haproxy/configuration/backends"))
			.expect(0)
			.mount(&server_mock)
			.await;
		Mock::given(method("PUT"))
			.and(path("/v1/services/haproxy/configuration/servers/srv_0"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server_mock)
			.await;

		let client = DataplaneClient::new(server_mock.uri(), None, None);

		let prev = AppliedState {
			frontends: Vec::new(),
			backends: vec![backend_with_servers(
				"back_service_server",
				Some(5000),
				vec![
					server("srv_0", "1.2.3.4", 8080, Maintenance::Disabled),
					server("srv_1", "1.2.3.5", 8081, Maintenance::Disabled),
				],
			)],
		};
		let next = AppliedState {
			frontends: Vec::new(),
			backends: vec![backend_with_servers(
				"back_service_server",
				Some(5000),
				vec![
					server("srv_0", "127.0.0.1", 1, Maintenance::Enabled),
					server("srv_1", "1.2.3.5", 8081, Maintenance::Disabled),
				],
			)],
		};

		apply(&client, &prev, &next).await.unwrap();
	}

	// S4 — a backend-level field change forces delete-then-recreate.
	#[tokio::test]
	async fn backend_model_change_forces_recreate() {
		let server_mock = MockServer::start().await;
		mount_transaction(&server_mock).await;

		Mock::given(method("DELETE"))
			.and(path("/v1/services/haproxy/configuration/backends/back_service_server"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server_mock)
			.await;
		Mock::given(method("POST"))
			.and(path("/v1/services/haproxy/configuration/backends"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server_mock)
			.await;
		Mock::given(method("POST"))
			.and(path("/v1/services/haproxy/configuration/servers"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server_mock)
			.await;

		let client = DataplaneClient::new(server_mock.uri(), None, None);

		let prev = AppliedState {
			frontends: Vec::new(),
			backends: vec![backend_with_servers(
				"back_service_server",
				Some(5000),
				vec![server("srv_0", "1.2.3.4", 8080, Maintenance::Disabled)],
			)],
		};
		let next = AppliedState {
			frontends: Vec::new(),
			backends: vec![backend_with_servers(
				"back_service_server",
				Some(9000),
				vec![server("srv_0", "1.2.3.4", 8080, Maintenance::Disabled)],
			)],
		};

		apply(&client, &prev, &next).await.unwrap();
	}
}
