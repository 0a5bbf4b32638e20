//! SQLite persistence for projects, messages, fragments, checkpoints and reviews.

pub mod db;
pub mod models;

pub use db::{AppDb, DbHandle};
pub use models::*;
