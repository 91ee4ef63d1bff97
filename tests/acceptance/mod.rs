//! Integration tests for sequencer acceptance testing.
//!
//! Most tests drive the sequencer from a manual tick source and need no
//! privileges. The real-time placement tests are ignored by default.

mod common;
mod release_test;
mod shutdown_test;
mod timing_test;
