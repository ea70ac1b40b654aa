pub mod control;
pub mod definition;
pub mod engine;
pub mod graph;
pub mod memory;
pub mod prompt;
pub mod runtime;
pub mod session;

pub use definition::AgentDefinition;
pub use engine::ExecutionEngine;
pub use graph::{EdgeCondition, EdgeSpec, GraphSpec, NextStep, NodeSpec, ToolSignal};
pub use memory::SharedMemory;
pub use runtime::AgentRuntime;
pub use session::Session;
