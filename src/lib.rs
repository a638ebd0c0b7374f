pub mod config;
pub mod engine;
pub mod janitor;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod provision;
pub mod scheduling;
pub mod schools;
pub mod sql;
pub mod wal;
pub mod wire;
