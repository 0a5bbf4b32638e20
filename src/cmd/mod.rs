//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `run`     | `Run`            |
//! | `init_db` | `InitDb`         |

pub mod init_db;
pub mod run;
pub mod serve;

pub use init_db::cmd_init_db;
pub use run::cmd_run;
pub use serve::cmd_serve;
