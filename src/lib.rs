pub mod config;
pub mod db;
pub mod endpoints;
pub mod engine;
pub mod indexer;
pub mod rpc;
pub mod tokens;
