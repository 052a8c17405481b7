pub mod alerts;
pub mod cache;
pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod features;
pub mod insights;
pub mod intake_status;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub(crate) mod retry;
pub mod secrets;
pub mod snapshot;
pub mod sources;
pub mod storage;
