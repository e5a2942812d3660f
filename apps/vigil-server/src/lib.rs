//! Multi-tenant website-change-monitoring engine.
//!
//! The engine watches registered URLs on a patrol cadence, reduces each
//! page to a noise-filtered fingerprint, classifies differences, and hands
//! compact alerts to a pluggable [`notifier::Notifier`]. A chat front-end
//! drives it through [`commands::Commander`]; all durable state lives in a
//! single crash-safe JSON document owned by [`store::Store`].
//!
//! Embedding looks like:
//!
//! ```no_run
//! # async fn run() -> Result<(), vigil_server::errors::EngineError> {
//! use std::sync::Arc;
//! use vigil_server::{config::EngineConfig, engine::Engine, notifier::LogNotifier};
//!
//! let engine = Engine::start(EngineConfig::from_env(), Arc::new(LogNotifier)).await?;
//! let commander = engine.commander();
//! let (ok, reason) = commander.add_monitor("chat-1", "https://example.com/news").await;
//! # let _ = (ok, reason);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod app_state;
pub mod breaker;
pub mod commands;
pub mod config;
pub mod detector;
pub mod engine;
pub mod errors;
pub mod governor;
pub mod headers;
pub mod history;
pub mod metrics;
pub mod models;
pub mod notifier;
pub mod patrol;
pub mod request_manager;
pub mod robots;
pub mod store;
pub mod tasks;
pub mod urlnorm;
pub mod util;

mod singleflight;

#[cfg(test)]
mod test_support;
