pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod overview;
pub mod pool;
pub mod postgres;
pub mod probe;
pub mod report;
pub mod scheduler;
pub mod secrets;


pub use config::Config;
pub use error::{Error, Result};
pub use overview::ReplicationOverview;
