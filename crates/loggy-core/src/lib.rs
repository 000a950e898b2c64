//! Core domain logic for the Loggy analytics proxy.
//!
//! This crate is network-free: it holds the source-rule model and
//! matcher, the captured-event model and ring buffer, the payload
//! extractor, the JSON path resolver, and runtime settings. The
//! `loggy-proxy` binary wires these into the data and control planes.

pub mod config;
pub mod events;
pub mod extract;
pub mod json_path;
pub mod sources;

pub use config::ProxySettings;
pub use events::{CapturedEvent, EventBuffer, EventMetadata};
pub use sources::{Source, SourceRegistry, UnmatchedDomain};
