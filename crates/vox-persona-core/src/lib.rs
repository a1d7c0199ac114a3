//! Core types, config, errors, and persona model for Vox Persona.

pub mod config;
pub mod error;
pub mod instruction;
pub mod types;
