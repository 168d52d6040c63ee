//! spatial-gw: parameter synchronization gateway between control surfaces
//! and a redundant spatial audio processor pair.

pub mod cli;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod state;

pub use engine::Engine;
