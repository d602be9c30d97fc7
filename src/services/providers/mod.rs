//! Process Adapters
//!
//! Command-backed implementations of the external collaborator traits.

mod generator;
mod test_runner;

pub use generator::{parse_response, CommandCodeGenerator, UnconfiguredGenerator};
pub use test_runner::{parse_counts, ShellTestRunner, MAX_TEST_OUTPUT_BYTES};
