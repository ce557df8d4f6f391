//! Adapts `MeshClient::authorize` to the authorization agent's
//! `Authorizer` trait (§4.B).

use futures::future::BoxFuture;

use crate::authz;
use crate::authz::server::Authorizer;

use super::model::AuthorizeRequest;
use super::MeshClient;

pub struct MeshAuthorizer {
	client: MeshClient,
	target: String,
}

impl MeshAuthorizer {
	pub fn new(client: MeshClient, target: String) -> Self {
		MeshAuthorizer { client, target }
	}
}

impl Authorizer for MeshAuthorizer {
	fn authorize(&self, client_cert_uri: String, client_cert_serial: String) -> BoxFuture<'static, Result<bool, authz::Error>> {
		let client = self.client.clone();
		let target = self.target.clone();
		Box::pin(async move {
			client
				.authorize(AuthorizeRequest {
					target,
					client_cert_uri,
					client_cert_serial,
				})
				.await
				.map_err(|e| authz::Error::Upstream(e.to_string()))
		})
	}
}
