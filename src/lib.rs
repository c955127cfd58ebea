#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! podrelay library — Kubernetes port-forward and log-stream sessions behind
//! an HTTP/WebSocket API.
//!
//! - `sessions` — session registry (identity, lifecycle, port reservations)
//! - `portforward` — local TCP listeners relayed to pod ports
//! - `logs` — pod log streaming with a per-session ring buffer
//! - `supervisor` — periodic sweep for lost pods and dead tasks
//! - `target` — how sessions reach pods (Kubernetes API)
//! - `routes` — REST handlers and the router
//! - `ws` — WebSocket log transport
//! - `config` — configuration loading

pub mod config;
pub mod error;
pub mod logs;
pub mod portforward;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod supervisor;
pub mod target;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::SessionError;
pub use sessions::SessionRegistry;
pub use state::AppState;
