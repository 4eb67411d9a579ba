//! Generation backend implementations
//!
//! This module contains the concrete implementations of the ChatBackend trait:
//! a local inference daemon reached over HTTP, and an in-process model
//! driven on a blocking worker thread.

pub mod local;
pub mod ollama;

pub use local::LocalBackend;
pub use ollama::OllamaBackend;
