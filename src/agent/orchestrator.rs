//! Turn orchestration: one user message in, one assistant reply out.
//!
//! Both entry points share the same sequence: serialize on the session,
//! append the user turn under the window, build the prompt context, call the
//! provider, then append the assistant turn. The streaming path forwards each
//! fragment as it arrives and finalizes through [`PendingReply`], which also
//! runs when the consumer drops the stream early.

use super::outcome::{StreamEvent, TurnFailure};
use super::prompt::{build_prompt_context, DEFAULT_SYSTEM_PROMPT};
use crate::config::Config;
use crate::providers::{self, CompletionOptions, Provider, ProviderError};
use crate::sessions::{self, push_windowed, SessionLockMap, SessionPermit, SessionStore, Turn};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Static per-process turn settings.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    /// Maximum number of stored turns per session (H).
    pub window: usize,
    pub system_prompt: String,
    pub completion: CompletionOptions,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            window: 6,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            completion: CompletionOptions {
                model: "gpt-4o-mini".to_string(),
                temperature: 0.4,
                max_tokens: 256,
                timeout: Duration::from_secs(20),
            },
        }
    }
}

pub struct TurnOrchestrator {
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn Provider>,
    locks: SessionLockMap,
    settings: TurnSettings,
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn Provider>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            store,
            provider,
            locks: SessionLockMap::new(),
            settings,
        }
    }

    /// Wire provider and session store from config.
    pub fn from_config(config: &Config) -> anyhow::Result<Arc<Self>> {
        let provider = providers::create_provider(
            &config.provider.name,
            config.provider.api_key.as_deref(),
            config.provider.api_url.as_deref(),
        )?;
        if !provider.has_credential() {
            warn!(
                provider = provider.name(),
                "No API key configured; turns will answer with a warning"
            );
        }
        let store = sessions::create_session_store(config.session_limits());
        Ok(Arc::new(Self::new(store, provider, config.turn_settings())))
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Current stored turns for a session, creating it if absent.
    pub fn history(&self, session_id: &str) -> Vec<Turn> {
        self.store.get_or_create(session_id)
    }

    /// Clear a session. Waits for any in-flight turn on it to finish first.
    pub async fn reset(&self, session_id: &str) {
        let _permit = self.locks.acquire(session_id).await;
        self.store.reset(session_id);
        info!(session_id, "session reset");
    }

    /// Drop idle session state. Returns the number of sessions evicted.
    pub fn prune_idle(&self) -> usize {
        let evicted = self.store.prune_expired();
        self.locks.prune_idle();
        evicted
    }

    /// Run a turn and return the whole reply.
    ///
    /// On failure the fallback text is stored as the assistant turn and the
    /// descriptor is returned for the caller to render. Without a credential
    /// nothing is stored and no call is made.
    pub async fn chat(&self, session_id: &str, message: &str) -> Result<String, TurnFailure> {
        if !self.provider.has_credential() {
            warn!(session_id, provider = self.provider.name(), "no upstream credential configured");
            return Err(TurnFailure::missing_credential(self.provider.name()));
        }

        let turn_id = Uuid::new_v4();
        let _permit = self.locks.acquire(session_id).await;
        let context = self.begin_turn(session_id, message);
        let started = Instant::now();

        let budget = self.settings.completion.timeout;
        let result = match timeout(
            budget,
            self.provider
                .chat_with_history(&context, &self.settings.completion),
        )
        .await
        {
            Ok(Ok(text)) => Ok(text.trim().to_string()),
            Ok(Err(err)) => Err(TurnFailure::from(err)),
            Err(_) => Err(TurnFailure::from(ProviderError::Timeout(budget))),
        };

        match &result {
            Ok(reply) => {
                self.record_reply(session_id, reply.clone());
                info!(
                    %turn_id,
                    session_id,
                    chars = reply.chars().count(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "turn completed"
                );
            }
            Err(failure) => {
                self.record_reply(session_id, failure.reply_text());
                warn!(%turn_id, session_id, error = %failure, "turn failed");
            }
        }

        result
    }

    /// Run a turn as a stream of events.
    ///
    /// The stream always starts with [`StreamEvent::Heartbeat`] and ends with
    /// exactly one [`StreamEvent::End`]. Dropping it early still stores the
    /// fragments received so far.
    pub fn stream_chat(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> BoxStream<'static, StreamEvent> {
        let this = Arc::clone(self);
        let session_id = session_id.into();
        let message = message.into();

        async_stream::stream! {
            yield StreamEvent::Heartbeat;

            if !this.provider.has_credential() {
                warn!(session_id = %session_id, provider = this.provider.name(), "no upstream credential configured");
                yield StreamEvent::Failure(TurnFailure::missing_credential(this.provider.name()));
                yield StreamEvent::End;
                return;
            }

            let turn_id = Uuid::new_v4();
            let permit = this.locks.acquire(&session_id).await;
            let context = this.begin_turn(&session_id, &message);
            let mut reply = PendingReply::new(Arc::clone(&this), session_id.clone(), turn_id, permit);
            let budget = this.settings.completion.timeout;

            let opened = timeout(
                budget,
                this.provider.stream_chat_with_history(&context, &this.settings.completion),
            )
            .await;

            match opened {
                Err(_) => {
                    let failure = TurnFailure::from(ProviderError::Timeout(budget));
                    warn!(%turn_id, session_id = %session_id, error = %failure, "stream turn failed");
                    yield StreamEvent::Failure(failure);
                }
                Ok(Err(err)) => {
                    let failure = TurnFailure::from(err);
                    warn!(%turn_id, session_id = %session_id, error = %failure, "stream turn failed");
                    yield StreamEvent::Failure(failure);
                }
                Ok(Ok(mut fragments)) => loop {
                    match timeout(budget, fragments.next()).await {
                        Ok(Some(Ok(fragment))) => {
                            reply.push(&fragment);
                            yield StreamEvent::Fragment(fragment);
                        }
                        Ok(Some(Err(err))) => {
                            let failure = TurnFailure::from(err);
                            warn!(%turn_id, session_id = %session_id, error = %failure, "stream turn failed mid-reply");
                            yield StreamEvent::Failure(failure);
                            break;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            let failure = TurnFailure::from(ProviderError::Timeout(budget));
                            warn!(%turn_id, session_id = %session_id, error = %failure, "stream turn stalled");
                            yield StreamEvent::Failure(failure);
                            break;
                        }
                    }
                },
            }

            reply.finish();
            yield StreamEvent::End;
        }
        .boxed()
    }

    /// Append the user turn, apply the window and return the prompt context.
    fn begin_turn(&self, session_id: &str, message: &str) -> Vec<Turn> {
        let mut history = self.store.get_or_create(session_id);
        push_windowed(&mut history, Turn::user(message), self.settings.window);
        let context = build_prompt_context(&self.settings.system_prompt, &history);
        self.store.replace(session_id, history);
        context
    }

    fn record_reply(&self, session_id: &str, text: String) {
        let mut history = self.store.get_or_create(session_id);
        push_windowed(&mut history, Turn::assistant(text), self.settings.window);
        self.store.replace(session_id, history);
    }
}

/// Accumulated text of a streamed reply. Stores it exactly once, on
/// [`PendingReply::finish`] or on drop, then releases the session.
struct PendingReply {
    orchestrator: Arc<TurnOrchestrator>,
    session_id: String,
    turn_id: Uuid,
    buffer: String,
    fragments: usize,
    finalized: bool,
    started: Instant,
    _permit: SessionPermit,
}

impl PendingReply {
    fn new(
        orchestrator: Arc<TurnOrchestrator>,
        session_id: String,
        turn_id: Uuid,
        permit: SessionPermit,
    ) -> Self {
        Self {
            orchestrator,
            session_id,
            turn_id,
            buffer: String::new(),
            fragments: 0,
            finalized: false,
            started: Instant::now(),
            _permit: permit,
        }
    }

    fn push(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
        self.fragments += 1;
    }

    fn finish(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        info!(
            turn_id = %self.turn_id,
            session_id = %self.session_id,
            fragments = self.fragments,
            chars = self.buffer.chars().count(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "stream turn finished"
        );

        if !self.buffer.is_empty() {
            let text = std::mem::take(&mut self.buffer);
            self.orchestrator.record_reply(&self.session_id, text);
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.finalized {
            debug!(turn_id = %self.turn_id, session_id = %self.session_id, "stream dropped before completion");
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{strings, Script, ScriptedProvider};
    use crate::agent::FailureKind;
    use crate::sessions::{InMemorySessionStore, Role};

    fn settings(window: usize) -> TurnSettings {
        TurnSettings {
            window,
            system_prompt: "sys".to_string(),
            ..TurnSettings::default()
        }
    }

    fn orchestrator(
        provider: Arc<ScriptedProvider>,
        window: usize,
    ) -> Arc<TurnOrchestrator> {
        Arc::new(TurnOrchestrator::new(
            Arc::new(InMemorySessionStore::new()),
            provider,
            settings(window),
        ))
    }

    async fn collect(stream: BoxStream<'static, StreamEvent>) -> Vec<StreamEvent> {
        stream.collect().await
    }

    fn assert_well_formed(events: &[StreamEvent]) {
        assert_eq!(events.first(), Some(&StreamEvent::Heartbeat));
        assert_eq!(events.last(), Some(&StreamEvent::End));
        let ends = events.iter().filter(|e| **e == StreamEvent::End).count();
        assert_eq!(ends, 1);
        let failures = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Failure(_)))
            .count();
        assert!(failures <= 1);
    }

    #[test]
    fn builds_from_default_config() {
        let mut config = Config::default();
        config.provider.api_key = Some("test-key".into());
        let orch = TurnOrchestrator::from_config(&config).unwrap();
        assert_eq!(orch.settings().window, 6);
        assert_eq!(orch.provider_name(), "OpenAI");
    }

    #[tokio::test]
    async fn chat_stores_user_and_trimmed_reply() {
        let provider = ScriptedProvider::new(Script::Reply("  Hello there \n".into()));
        let orch = orchestrator(provider.clone(), 6);

        let reply = orch.chat("s1", "hi").await.unwrap();

        assert_eq!(reply, "Hello there");
        assert_eq!(
            orch.history("s1"),
            vec![Turn::user("hi"), Turn::assistant("Hello there")]
        );
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn prompt_context_is_instruction_plus_window() {
        let provider = ScriptedProvider::new(Script::Echo);
        let orch = orchestrator(provider.clone(), 6);

        let reply = orch.chat("s1", "hi").await.unwrap();

        assert_eq!(reply, "system:sys|user:hi");
        let contexts = provider.contexts();
        assert_eq!(contexts[0][0].role, Role::System);
        assert_eq!(contexts[0].len(), 2);
    }

    #[tokio::test]
    async fn history_never_exceeds_window() {
        let provider = ScriptedProvider::new(Script::Reply("ok".into()));
        let orch = orchestrator(provider.clone(), 6);

        for i in 0..5 {
            orch.chat("s1", &format!("m{i}")).await.unwrap();
            assert!(orch.history("s1").len() <= 6);
        }

        let history = orch.history("s1");
        assert_eq!(history.len(), 6);
        assert_eq!(history[0], Turn::user("m2"));
        assert_eq!(history[5], Turn::assistant("ok"));

        // Context of the last call: instruction plus at most H stored turns.
        let last = provider.contexts().pop().unwrap();
        assert!(last.len() <= 7);
        assert_eq!(last.last(), Some(&Turn::user("m4")));
    }

    #[tokio::test]
    async fn upstream_failure_stores_fallback_text() {
        let provider = ScriptedProvider::new(Script::Fail("connection refused".into()));
        let orch = orchestrator(provider, 6);

        let failure = orch.chat("s1", "hi").await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Upstream);
        assert!(failure.reply_text().starts_with("⚠️ Upstream error: "));
        let history = orch.history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], Turn::assistant(failure.reply_text()));
    }

    #[tokio::test]
    async fn missing_credential_skips_call_and_history() {
        let provider = ScriptedProvider::without_credential();
        let orch = orchestrator(provider.clone(), 6);

        let failure = orch.chat("s1", "hi").await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Configuration);
        assert_eq!(failure.reply_text(), "⚠️ Server missing OPENAI_API_KEY.");
        assert_eq!(provider.calls(), 0);
        assert!(orch.history("s1").is_empty());
    }

    #[tokio::test]
    async fn chat_times_out_per_budget() {
        let provider = ScriptedProvider::new(Script::Stall);
        let mut settings = settings(6);
        settings.completion.timeout = Duration::from_millis(50);
        let orch = TurnOrchestrator::new(Arc::new(InMemorySessionStore::new()), provider, settings);

        let failure = orch.chat("s1", "hi").await.unwrap_err();

        assert_eq!(failure.kind, FailureKind::Upstream);
        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test]
    async fn reset_clears_only_target_session() {
        let provider = ScriptedProvider::new(Script::Reply("ok".into()));
        let orch = orchestrator(provider, 6);
        orch.chat("a", "hi").await.unwrap();
        orch.chat("b", "hi").await.unwrap();

        orch.reset("a").await;

        assert!(orch.history("a").is_empty());
        assert_eq!(orch.history("b").len(), 2);
    }

    #[tokio::test]
    async fn stream_forwards_fragments_verbatim_and_stores_concatenation() {
        let provider = ScriptedProvider::new(Script::Fragments(strings(&["Hel", "lo", "", " there "])));
        let orch = orchestrator(provider, 6);

        let events = collect(orch.stream_chat("s1", "hi")).await;

        assert_well_formed(&events);
        assert_eq!(
            events,
            vec![
                StreamEvent::Heartbeat,
                StreamEvent::Fragment("Hel".into()),
                StreamEvent::Fragment("lo".into()),
                StreamEvent::Fragment(String::new()),
                StreamEvent::Fragment(" there ".into()),
                StreamEvent::End,
            ]
        );
        assert_eq!(
            orch.history("s1"),
            vec![Turn::user("hi"), Turn::assistant("Hello there ")]
        );
    }

    #[tokio::test]
    async fn stream_failure_mid_reply_keeps_partial_text() {
        let provider = ScriptedProvider::new(Script::FragmentsThenFail(
            strings(&["partial"]),
            "reset by peer".into(),
        ));
        let orch = orchestrator(provider, 6);

        let events = collect(orch.stream_chat("s1", "hi")).await;

        assert_well_formed(&events);
        assert_eq!(events[1], StreamEvent::Fragment("partial".into()));
        assert!(matches!(&events[2], StreamEvent::Failure(f) if f.kind == FailureKind::Upstream));
        assert_eq!(
            orch.history("s1"),
            vec![Turn::user("hi"), Turn::assistant("partial")]
        );
    }

    #[tokio::test]
    async fn stream_failure_before_output_stores_no_reply() {
        let provider = ScriptedProvider::new(Script::Fail("bad gateway".into()));
        let orch = orchestrator(provider, 6);

        let events = collect(orch.stream_chat("s1", "hi")).await;

        assert_well_formed(&events);
        assert_eq!(events.len(), 3);
        assert_eq!(orch.history("s1"), vec![Turn::user("hi")]);
    }

    #[tokio::test]
    async fn stream_without_credential_reports_and_ends() {
        let provider = ScriptedProvider::without_credential();
        let orch = orchestrator(provider.clone(), 6);

        let events = collect(orch.stream_chat("s1", "hi")).await;

        assert_well_formed(&events);
        assert!(matches!(&events[1], StreamEvent::Failure(f) if f.kind == FailureKind::Configuration));
        assert_eq!(provider.calls(), 0);
        assert!(orch.history("s1").is_empty());
    }

    #[tokio::test]
    async fn stalled_stream_times_out_and_keeps_partial_text() {
        let provider = ScriptedProvider::new(Script::FragmentsThenStall(strings(&["so far"])));
        let mut settings = settings(6);
        settings.completion.timeout = Duration::from_millis(50);
        let orch = Arc::new(TurnOrchestrator::new(
            Arc::new(InMemorySessionStore::new()),
            provider,
            settings,
        ));

        let events = collect(orch.stream_chat("s1", "hi")).await;

        assert_well_formed(&events);
        assert!(matches!(&events[2], StreamEvent::Failure(f) if f.message.contains("timed out")));
        assert_eq!(orch.history("s1")[1], Turn::assistant("so far"));
    }

    #[tokio::test]
    async fn dropped_stream_persists_partial_reply_once() {
        let provider = ScriptedProvider::new(Script::FragmentsThenStall(strings(&["abc", "def"])));
        let mut settings = settings(6);
        settings.completion.timeout = Duration::from_millis(50);
        let orch = Arc::new(TurnOrchestrator::new(
            Arc::new(InMemorySessionStore::new()),
            provider,
            settings,
        ));

        let mut stream = orch.stream_chat("s1", "hi");
        assert_eq!(stream.next().await, Some(StreamEvent::Heartbeat));
        assert_eq!(stream.next().await, Some(StreamEvent::Fragment("abc".into())));
        assert_eq!(stream.next().await, Some(StreamEvent::Fragment("def".into())));
        drop(stream);

        assert_eq!(
            orch.history("s1"),
            vec![Turn::user("hi"), Turn::assistant("abcdef")]
        );

        // The session lock was released by the drop; the scripted chat stalls
        // and times out, storing the fallback text.
        assert!(orch.chat("s1", "next").await.is_err());
        assert_eq!(orch.history("s1").len(), 4);
    }

    #[tokio::test]
    async fn same_session_turns_are_serialized() {
        let provider = ScriptedProvider::new(Script::Echo);
        let orch = orchestrator(provider.clone(), 20);

        let mut handles = Vec::new();
        for i in 0..8 {
            let orch = Arc::clone(&orch);
            handles.push(tokio::spawn(async move {
                orch.chat("shared", &format!("m{i}")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Strict user/assistant alternation: no interleaving within the session.
        let history = orch.history("shared");
        assert_eq!(history.len(), 16);
        for pair in history.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
            assert!(pair[1].content.ends_with(&format!("user:{}", pair[0].content)));
        }
    }

    #[tokio::test]
    async fn stream_and_chat_share_history() {
        let provider = ScriptedProvider::new(Script::Echo);
        let orch = orchestrator(provider.clone(), 6);

        collect(orch.stream_chat("s1", "one")).await;
        orch.chat("s1", "two").await.unwrap();

        let last = provider.contexts().pop().unwrap();
        assert_eq!(last.len(), 4);
        assert_eq!(last[1], Turn::user("one"));
        assert_eq!(last[3], Turn::user("two"));
    }
}
