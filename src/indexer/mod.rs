pub mod chain;
pub mod decoder;
pub mod fetch;
pub mod holders;
pub mod mapper;
pub mod receipt_fetcher;
pub mod span;
pub mod types;
