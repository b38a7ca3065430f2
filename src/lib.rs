pub mod config;
pub mod dashboard;
pub mod error;
pub mod joblist;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{PoolError, Result};
