//! Agent graphs: phases (`NodeSpec`) joined by conditional transitions
//! (`EdgeSpec`), with the edge evaluation that decides what runs after each
//! model turn.

pub mod edge;
pub mod node;
pub mod spec;

pub use edge::{evaluate_condition, EdgeCondition, EdgeSpec};
pub use node::NodeSpec;
pub use spec::{AgentMetadata, GraphSpec, NextStep, ToolSignal, DEFAULT_ENTRY_POINT};
