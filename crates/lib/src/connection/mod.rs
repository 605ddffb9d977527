//! Connection registry: the single source of truth for which backend process
//! is serving, plus the keyed request/response helper built on top of it.
//!
//! Only the registry mutates connection state. Everything else reads snapshots
//! or goes through `restart()` and the supervisor notifications.

mod error;
mod registry;
mod rpc;

pub use error::ClientError;
pub(crate) use error::ensure_success;
pub use registry::{
    BackendSupervisor, ConnectionRegistry, ConnectionState, EndpointDescriptor, SupervisorNotice,
};
pub use rpc::{RpcClient, RpcRequest};
