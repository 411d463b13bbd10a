pub mod agent;
pub mod budget;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod governance;
pub mod logging;
pub mod phase;
pub mod retry;
pub mod state;
pub mod store;
pub mod swarm;
