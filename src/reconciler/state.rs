//! `AppliedState` (§3, §4.E.1): the reconciler's model of what the data
//! plane currently runs. Equality is structural — no interior
//! mutability or path aliasing, so `derive(PartialEq, Eq)` already
//! satisfies spec.md §9's "State equality" note.

use crate::dataplane::model::{Backend as BackendModel, Bind, Filter, Frontend as FrontendModel, HttpRequestRule, LogTarget, Server, TcpRequestRule};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendFilter {
	pub filter: Filter,
	pub tcp_request_rule: TcpRequestRule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frontend {
	pub model: FrontendModel,
	pub bind: Bind,
	pub log_target: Option<LogTarget>,
	pub filter: Option<FrontendFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
	pub model: BackendModel,
	/// Position in this vector is the slot table's fixed-capacity index;
	/// `servers[i].name == "srv_<i>"` always.
	pub servers: Vec<Server>,
	pub log_target: Option<LogTarget>,
	pub http_request_rules: Vec<HttpRequestRule>,
}

/// The reconciler's whole model of the live proxy (§3). `generate` and
/// `read_back` both produce one; they must agree when the proxy matches
/// the plan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppliedState {
	/// Sorted by name.
	pub frontends: Vec<Frontend>,
	/// Sorted by name.
	pub backends: Vec<Backend>,
}

impl AppliedState {
	pub fn empty() -> Self {
		AppliedState::default()
	}

	pub fn sort(&mut self) {
		self.frontends.sort_by(|a, b| a.model.name.cmp(&b.model.name));
		self.backends.sort_by(|a, b| a.model.name.cmp(&b.model.name));
	}

	pub fn frontend(&self, name: &str) -> Option<&Frontend> {
		self.frontends.iter().find(|f| f.model.name == name)
	}

	pub fn backend(&self, name: &str) -> Option<&Backend> {
		self.backends.iter().find(|b| b.model.name == name)
	}
}
