//! Repository implementations for database operations

pub mod backtest;
pub mod signals;

pub use backtest::*;
pub use signals::*;
