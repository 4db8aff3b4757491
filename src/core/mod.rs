//! Core domain models for the delivery pipeline
//!
//! This module defines pipeline definitions, runs, artifacts and their
//! configuration. Nothing here talks to collaborators.

pub mod artifact;
pub mod buildspec;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod state;

pub use artifact::{Artifact, ArtifactStore, Bundle, RetentionPolicy};
pub use error::{ActionError, FailureKind};
pub use pipeline::*;
pub use state::*;
