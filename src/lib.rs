//! Sim Demon Library
//!
//! Headless front end for the build cache and device session orchestrator.

pub mod headless;

pub use headless::runner::{run_headless, HeadlessOptions};
