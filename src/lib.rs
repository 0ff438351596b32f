pub mod admission;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod engine;
pub mod limits;
pub mod lock;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod store;
pub mod wal;
