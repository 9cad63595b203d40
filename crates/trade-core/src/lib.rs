//! Shared foundation of the trade-lifecycle manager: store row types, the
//! lifecycle vocabulary, the pure condition evaluator, trading-hours gates,
//! configuration and the common error type.

pub mod conditions;
pub mod config;
pub mod error;
pub mod hours;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
