//! Infrastructure layer of the Tactile client.
//!
//! **Dependency rule**: this layer may depend on `tactile_core` but MUST NOT
//! import the `application` layer.

pub mod connector;
