// formcollab-relay: room relay for real-time collaborative form editing.

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod idempotency;
pub mod log;
pub mod metrics;
pub mod notify;
pub mod rooms;
pub mod sync;
pub mod ws;
