//! srec-watch library crate.
//!
//! Watches live streams, captures them with an external process and
//! sends notifications. Exposed as a library for integration testing.

pub mod admission;
pub mod app;
pub mod capture;
pub mod config;
pub mod domain;
pub mod error;
pub mod handler;
pub mod logging;
pub mod notification;
pub mod panic_hook;
pub mod recorder;
pub mod supervisor;
pub mod utils;

pub use error::{Error, Result};
