// Conversation Automation Engine
//
// Resumable, per-conversation workflow interpreter. Executions start from
// inbound webhook events, walk a definition's step graph, pause indefinitely
// at wait_for_reply steps and resume when the contact answers.

pub mod definition;
pub mod engine;
pub mod pending;
pub mod resolver;
pub mod steps;

pub use definition::{
    AutomationDefinition, Execution, ExecutionStatus, KeywordMatchMode, TriggerConfig, TriggerKind,
};
pub use engine::{ExecutionEngine, ResumeInput, ResumeOutcome, SweepReport};
pub use pending::{MemoryPendingStore, PendingExecution, PendingExecutionStore, PgPendingStore};
pub use resolver::{TriggerInput, TriggerResolver};
pub use steps::{BranchArm, Predicate, PredicateOp, ReplyFilter, Step, StepAction};
