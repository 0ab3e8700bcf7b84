//! Prompt context construction.

use crate::sessions::Turn;

/// Instruction prepended to every prompt context.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Clarity Coach, a concise, encouraging assistant. \
     Answer clearly, step-by-step when asked, and prefer practical guidance.";

/// System instruction followed by the already-windowed history.
/// Rebuilt for every call and never stored.
pub fn build_prompt_context(system_prompt: &str, history: &[Turn]) -> Vec<Turn> {
    let mut context = Vec::with_capacity(history.len() + 1);
    context.push(Turn::system(system_prompt));
    context.extend_from_slice(history);
    context
}
