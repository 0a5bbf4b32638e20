pub mod agent;
pub mod config;
pub mod errors;
pub mod github;
pub mod logging;
pub mod review;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod util;
pub mod workflow;
