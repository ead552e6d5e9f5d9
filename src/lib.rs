pub mod config;
pub mod daemon;
pub mod graph;
pub mod ingest;
pub mod inventory;
pub mod logging;
pub mod resolver;
pub mod score;
pub mod shim;
pub mod store;
