pub mod acquire;
pub mod alert;
pub mod config;
pub mod error;
pub mod extract;
pub mod io;
pub mod notify;
pub mod paths;
pub mod pipeline;
pub mod retry;
pub mod sample;
pub mod serve;
pub mod store;
pub mod subscribers;

pub use error::{Result, TremorError};
