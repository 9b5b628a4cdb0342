//! Crate containing common types and helpers used by all TFS components

#[macro_use]
extern crate tracing;

pub mod background;
pub mod config;
pub mod data;
pub mod error;
pub mod fname;
pub mod time;
