pub mod orchestrator;
pub mod outcome;
pub mod prompt;

#[cfg(test)]
pub(crate) mod testing;

#[allow(unused_imports)]
pub use orchestrator::{TurnOrchestrator, TurnSettings};
#[allow(unused_imports)]
pub use outcome::{FailureKind, StreamEvent, TurnFailure};
#[allow(unused_imports)]
pub use prompt::{build_prompt_context, DEFAULT_SYSTEM_PROMPT};
