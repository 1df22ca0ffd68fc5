#![doc = include_str!("../README.md")]

pub mod cache;
pub mod config;
pub mod consumer;
pub mod directory;
pub mod error;
pub mod telemetry;

pub use error::{Error, Result};
