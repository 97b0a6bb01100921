pub mod cli;
pub mod config;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod sync;
