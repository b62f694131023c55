pub mod abi;
pub mod api_client;
pub mod cache;
pub mod config;
pub mod content;
pub mod index_api;
pub mod ipfs;
pub mod registry;
pub mod snapshot;
pub mod sync;
pub mod transactions;
