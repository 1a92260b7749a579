// Task lifecycle state machine
//
// pending -> running -> {completed, failed}; pending|running -> cancelled.
// Every status sink routes updates through TaskStateMachine::apply.

pub mod errors;
pub mod events;
pub mod states;
pub mod task_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::TaskEvent;
pub use states::TaskState;
pub use task_state_machine::TaskStateMachine;
