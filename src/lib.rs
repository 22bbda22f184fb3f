//! Staged document conversion pipeline.
//!
//! A submitted document moves through Convert, Extract, Structure, Generate
//! and Score. Every transition is persisted, so an interrupted job resumes
//! at the stage after its last success. Layout and structure hints come from
//! a chain of analysis providers with timeouts and fallback.

pub mod anthropic;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod observer;
pub mod orchestrator;
pub mod scoring;
pub mod stages;
pub mod state_machine;
pub mod store;
pub mod ui;
