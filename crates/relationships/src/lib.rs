//! Symmetric pairwise relationship state and the compatibility engine.

pub mod compatibility;
pub mod manager;

pub use compatibility::{CompatibilityAnalysis, CompatibilityEngine, InteractionSuggestions};
pub use manager::RelationshipManager;
