//! Scripted provider used by orchestrator and gateway tests.

use crate::providers::{CompletionOptions, FragmentStream, Provider, ProviderError, Turn};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Script {
    /// Fixed reply; streamed as a single fragment.
    Reply(String),
    /// Reply with the prompt context rendered as `role:content|role:content`.
    Echo,
    /// Fail the call before any output.
    Fail(String),
    /// Stream these fragments then finish.
    Fragments(Vec<String>),
    /// Stream these fragments then fail.
    FragmentsThenFail(Vec<String>, String),
    /// Stream these fragments then never produce another one.
    FragmentsThenStall(Vec<String>),
    /// Never answer.
    Stall,
}

pub struct ScriptedProvider {
    script: Script,
    credential: bool,
    calls: AtomicUsize,
    contexts: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedProvider {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            credential: true,
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn without_credential() -> Arc<Self> {
        Arc::new(Self {
            script: Script::Echo,
            credential: false,
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompt contexts received, in call order.
    pub fn contexts(&self) -> Vec<Vec<Turn>> {
        self.contexts.lock().clone()
    }

    fn record(&self, messages: &[Turn]) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(messages.to_vec());
    }
}

fn echo(messages: &[Turn]) -> String {
    messages
        .iter()
        .map(|t| format!("{}:{}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("|")
}

fn fragments(items: &[String]) -> impl futures_util::Stream<Item = Result<String, ProviderError>> {
    futures_util::stream::iter(items.to_vec().into_iter().map(Ok))
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn chat_with_history(
        &self,
        messages: &[Turn],
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.record(messages);
        match &self.script {
            Script::Reply(text) => Ok(text.clone()),
            Script::Echo => Ok(echo(messages)),
            Script::Fail(msg) | Script::FragmentsThenFail(_, msg) => {
                Err(ProviderError::Transport(msg.clone()))
            }
            Script::Fragments(parts) => Ok(parts.concat()),
            Script::FragmentsThenStall(_) | Script::Stall => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::Empty("stalled".into()))
            }
        }
    }

    async fn stream_chat_with_history(
        &self,
        messages: &[Turn],
        _options: &CompletionOptions,
    ) -> Result<FragmentStream, ProviderError> {
        self.record(messages);
        let stream: FragmentStream = match &self.script {
            Script::Reply(text) => fragments(&[text.clone()]).boxed(),
            Script::Echo => fragments(&[echo(messages)]).boxed(),
            Script::Fail(msg) => return Err(ProviderError::Transport(msg.clone())),
            Script::Fragments(parts) => fragments(parts).boxed(),
            Script::FragmentsThenFail(parts, msg) => fragments(parts)
                .chain(futures_util::stream::once(futures_util::future::ready(Err(
                    ProviderError::Transport(msg.clone()),
                ))))
                .boxed(),
            Script::FragmentsThenStall(parts) => fragments(parts)
                .chain(futures_util::stream::pending())
                .boxed(),
            Script::Stall => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(ProviderError::Empty("stalled".into()));
            }
        };
        Ok(stream)
    }

    fn has_credential(&self) -> bool {
        self.credential
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}
