//! Large-media preparation pipeline for AI alt-text and caption generation.
//!
//! A job arrives as a media reference plus a generation kind. The
//! orchestrator fetches the bytes, applies the size policy, optionally
//! compresses or chunks video through the encoder engine, posts the
//! payloads to the generation proxy, and streams progress and results back
//! over a long-lived port.

pub mod config;
pub mod error;
pub mod fetch;
pub mod job;
pub mod logging;
pub mod offscreen;
pub mod orchestrator;
pub mod policy;
pub mod proxy;
pub mod transport;

pub use error::{Error, Result};
