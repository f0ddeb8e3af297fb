pub mod backup;
pub mod config;
pub mod discovery;
pub mod error;
pub mod models;
pub mod notify;
pub mod service;
pub mod utils;

pub use error::AppError;
