//! JSON-RPC plumbing: hex codec, raw response shapes, the error taxonomy and
//! a paced single-endpoint client.

pub mod client;
pub mod error;
pub mod hex;
pub mod types;

pub use client::{RpcClient, RpcClientOptions};
pub use error::{classify, EndpointHealth, ErrorClass, RpcError};
