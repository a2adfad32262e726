//! Endpoint selection and the per-chain runtime config cache.

pub mod pool;
pub mod runtime;

pub use pool::{rank_endpoints, resolve_rpc, ChainEndpoint, ClientSlot, EndpointCooldowns, ResolvedRpc};
pub use runtime::{ChainDefaults, ChainRuntime, RuntimeConfigCache};
