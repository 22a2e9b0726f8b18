//! HTTP and WebSocket surface.
//!
//! | Module   | Responsibility                                          |
//! |----------|---------------------------------------------------------|
//! | `api`    | REST handlers, `AppState`, `ApiError` → JSON responses  |
//! | `ws`     | Per-project WebSocket sessions and connection stats     |
//! | `server` | Router assembly, CORS, bind, graceful shutdown          |

pub mod api;
pub mod server;
pub mod ws;

pub use api::{AppState, SharedState};
pub use server::{ServeOptions, build_router, serve, shutdown_signal};
