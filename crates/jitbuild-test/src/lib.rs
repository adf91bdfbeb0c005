//! Test harnesses for the jitbuild asset server.
//!
//! Provides `StubEngine`, a deterministic stand-in for the external
//! compilers, and `TestServer` for full-stack middleware tests.

#[cfg(test)]
pub mod cli;
pub mod engine;
#[cfg(test)]
mod scenarios;
pub mod server;

pub use engine::StubEngine;
pub use server::{copy_fixtures, fixtures, TestError, TestServer, MOUNT};
