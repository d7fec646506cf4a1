//! Protocol implementations.
//!
//! Each protocol has a parser module used by the runtime event loop.
//!
//! - `pizza`: line-based pizza order protocol

pub mod pizza;
