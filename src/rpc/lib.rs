//! Crate containing the semantic message set exchanged between TFS
//! components, the length-framed codec that carries them, and the
//! client/server plumbing around it

#[macro_use]
extern crate tracing;

pub mod client;
pub mod codec;
pub mod message;
pub mod server;
pub mod vip;

pub use client::*;
pub use message::*;
pub use server::*;
