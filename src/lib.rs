//! A service-mesh sidecar proxy controller: watches a mesh agent's
//! desired state and reconciles it into a local L4/L7 proxy's
//! configuration via its transactional management API, and runs an
//! authorization callback server for the proxy's intention-policy
//! checks.

pub mod authz;
pub mod cert_store;
pub mod codec;
pub mod config;
pub mod dataplane;
pub mod mesh;
pub mod process;
pub mod reconciler;
pub mod supervisor;
pub mod watch;
