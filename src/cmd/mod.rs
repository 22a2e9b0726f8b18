//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `db`     | `InitDb`         |
//! | `check`  | `CheckConfig`    |

pub mod check;
pub mod db;
pub mod serve;

pub use check::cmd_check_config;
pub use db::cmd_init_db;
pub use serve::cmd_serve;
