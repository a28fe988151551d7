//! Pode: a multi-protocol application server.
//!
//! Endpoints speak HTTP/1.1, HTTPS (with optional client certificates),
//! SMTP, raw TCP and WebSocket. Requests flow through an ordered middleware
//! pipeline with pluggable authentication and session persistence, and a
//! cooperative worker runtime multiplexes connections, interval timers and
//! cron/wall-clock schedules over a single shared, lockable server state.
//!
//! ```rust,no_run
//! use pode::config::ServerConfig;
//! use pode::endpoint::{Endpoint, Protocol};
//! use pode::pipeline::handler;
//! use pode::router::Route;
//! use pode::server::Server;
//! use http::Method;
//!
//! let server = Server::new(ServerConfig::default(), |ctx| {
//!     ctx.endpoints
//!         .add(Endpoint::new(Protocol::Http, "127.0.0.1", 8080)?)?;
//!     ctx.router.add(Route::new(
//!         Some(Method::GET),
//!         "/ping",
//!         handler(|event| {
//!             event.response.text("pong");
//!             Ok(())
//!         }),
//!     )?)?;
//!     Ok(())
//! });
//! server.run().unwrap();
//! ```

pub mod auth;
pub mod cli;
pub mod config;
pub mod connection;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod ids;
pub mod listener;
pub mod pipeline;
pub mod protocol;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod state;
pub mod static_files;
pub mod watcher;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use endpoint::{Endpoint, Protocol};
pub use error::{Error, Result};
pub use pipeline::{handler, HttpEvent};
pub use router::{Route, Router};
pub use server::Server;
