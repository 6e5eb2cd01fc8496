//! Order Edit API Library
//!
//! Post-authorization order modification: the authorization-adjustment
//! saga (add item, change quantity, cancel) plus the fallback capture
//! reconciliation job.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod idempotency;
pub mod queue;
pub mod retry;
pub mod services;
pub mod store;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Shared application state handed to the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub modifications: Arc<services::saga::OrderModificationService>,
}
