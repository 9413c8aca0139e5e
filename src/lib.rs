//! Kiln - cache-keyed container image builder
//!
//! Build scripts run verb by verb against a container engine. Each verb's
//! cache key is stored as the commit annotation of the image it produced,
//! so unchanged steps are replayed from the image history. Layers skipped
//! during a build are edited out of the final image through a
//! content-addressable layer store.

pub mod build;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod multi;
pub mod pull;
pub mod script;
pub mod signal;
pub mod store;
pub mod ui;

pub use error::{KilnError, KilnResult};
