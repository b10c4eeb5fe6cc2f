use crate::utilities::memory::ArenaHandle;

// Newtype Pattern for enhanced type safety
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct GraphNodeHandle(pub ArenaHandle);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct GraphEdgeHandle(pub ArenaHandle);

/// Identifies a constraint within the rule it was registered with.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ConstraintId {
    pub container_id: u32,
    pub constraint_index: u32,
}

// Simple implementations for Display for user-friendliness
impl std::fmt::Display for GraphNodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "GraphNodeHandle<{}:{}>", self.0.index, self.0.generation)
    }
}

impl std::fmt::Display for GraphEdgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "GraphEdgeHandle<{}:{}>", self.0.index, self.0.generation)
    }
}

impl std::fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ConstraintId<{}:{}>",
            self.container_id, self.constraint_index
        )
    }
}
