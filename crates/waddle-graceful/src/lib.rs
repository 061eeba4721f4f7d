//! # waddle-graceful
//!
//! Graceful shutdown for Waddle TCP servers.
//!
//! ## Overview
//!
//! A [`GracefulServer`] stops accepting new connections when its shutdown
//! trigger fires, then waits for every in-flight unit of work before its
//! serve loop returns:
//! 1. Every accepted connection counts as one unit until it is closed or dropped
//! 2. Background routines registered with [`GracefulServer::run_routine`] count too
//! 3. On trigger, the listener is closed and the OS refuses new connections
//! 4. The accept loop drains outstanding units, then `serve` returns `Ok(())`
//!
//! ## Environment Variables
//!
//! - `WADDLE_GRACEFUL_ADDR`: Address to bind (default: `0.0.0.0:80`)
//! - `WADDLE_DRAIN_TIMEOUT_SECS`: Bound on the drain phase (default: unbounded)
//!
//! ## Example
//!
//! ```ignore
//! use waddle_graceful::{GracefulConfig, GracefulServer};
//!
//! let server = GracefulServer::new(GracefulConfig::from_env(), |conn, _peer| async move {
//!     // speak your protocol over `conn`, then close it
//!     let _ = conn.close().await;
//! });
//!
//! let handle = server.shutdown_handle();
//! tokio::spawn(async move { handle.trigger_on_os_signal().await });
//!
//! server.listen_and_serve().await?;
//! ```

mod config;
mod connection;
mod error;
mod listener;
mod server;
pub mod signal;
mod tracker;

pub use config::{GracefulConfig, DEFAULT_ADDR};
pub use connection::GracefulConnection;
pub use error::{Error, Result};
pub use listener::{GracefulListener, Listener};
pub use server::{listen_and_serve, serve, GracefulServer, Handler};
pub use signal::{ShutdownHandle, ShutdownSignal};
pub use tracker::{ActivityTracker, UnitGuard};
