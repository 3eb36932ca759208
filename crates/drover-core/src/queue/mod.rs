//! Queue module: dependency engine and retry decisions.

mod dependency;
mod retry;

pub use dependency::DependencyEngine;
pub use retry::{Decision, RetryPolicy};
