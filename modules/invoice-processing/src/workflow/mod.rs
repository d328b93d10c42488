//! Workflow layer: the lifecycle state machine and SLA tracking.

pub mod sla;
pub mod state_machine;

pub use sla::{SlaConfig, SlaManager, SlaRecord, SlaStage};
pub use state_machine::{StateMachine, StateTransition, TransitionAction, WorkflowRecord};
