//! Session orchestration: lifecycle commands, failure supervision and the
//! sink writer thread.

pub mod orchestrator;
pub mod supervisor;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_support;

pub use orchestrator::{Components, StreamSession};
