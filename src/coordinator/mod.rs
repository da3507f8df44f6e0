// Cross-context coordination: owner registry, messaging and the Surface Coordinator.

pub mod context;
pub mod messaging;
pub mod registry;
