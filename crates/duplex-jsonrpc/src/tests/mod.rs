//! Integration suites for the peer engine, run over in-process pairs.

mod cancel_tests;
mod push_tests;
