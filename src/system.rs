//! System utilities and monitoring
//!
//! This module contains metrics and the load-testing harness used by the
//! command line tool and the concurrency tests.

pub mod metrics;
pub mod stress;
