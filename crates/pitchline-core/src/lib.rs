//! Core config, errors, session model, and archive types for Pitchline.

pub mod archive;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
