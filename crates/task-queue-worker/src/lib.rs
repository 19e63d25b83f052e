pub mod config;
pub mod executor;
pub mod handler;
pub mod worker;

pub use config::WorkerConfig;
pub use executor::TaskExecutor;
pub use worker::Worker;
