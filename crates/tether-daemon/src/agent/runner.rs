//! The multi-turn agent loop
//!
//! One prompt at a time: capture the screen, ask the model for actions, run
//! them against the session, and go around again only when the model's last
//! action asked to see the screen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_core::config::AgentConfig;
use tether_core::error::AgentError;
use tether_core::traits::{CompletionRequest, CompletionService};
use tether_protocol::{Event, SessionId};

use super::action::{parse_response, Action};
use super::conversation::Conversation;
use super::terminal::TerminalAccess;
use crate::pty::{ScreenCapture, ScreenWindow};

/// Capacity of the agent event channel
pub const AGENT_EVENT_CHANNEL_CAPACITY: usize = 64;

const SYSTEM_PROMPT: &str = r#"You operate a terminal on the user's computer.
Each user message contains the user's request and/or the current screen text.
Reply with one JSON object and nothing else:
{"thinking": "<short reasoning>", "actions": [ ... ]}
Actions:
  {"type": "keystroke", "value": "<bytes to type; use \n for Enter>"}
  {"type": "delay", "ms": <milliseconds>}
  {"type": "message", "text": "<note for the user>"}
  {"type": "request_screen", "sliceStart": <chars back from end, optional>, "sliceEnd": <chars back from end, optional>}
You only get another turn if your last action is request_screen.
Return an empty actions array when the task is done."#;

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentPhase {
    #[default]
    Idle,
    Capturing,
    AwaitingCompletion,
    Executing,
}

/// Progress reported to the phone
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Thinking(String),
    Message(String),
    Action(Action),
    Complete { turns: u32 },
    Error { error: String, raw: Option<String> },
}

impl AgentEvent {
    pub fn to_event(&self) -> Event {
        match self {
            AgentEvent::Thinking(text) => Event::AiThinking { text: text.clone() },
            AgentEvent::Message(text) => Event::AiMessage { text: text.clone() },
            AgentEvent::Action(action) => Event::AiAction {
                action: serde_json::to_value(action).unwrap_or_default(),
            },
            AgentEvent::Complete { turns } => Event::AiComplete { turns: *turns },
            AgentEvent::Error { error, raw } => Event::AiError {
                error: error.clone(),
                raw: raw.clone(),
            },
        }
    }
}

struct Inner {
    completion: Arc<dyn CompletionService>,
    terminal: Arc<dyn TerminalAccess>,
    config: AgentConfig,
    events: mpsc::Sender<AgentEvent>,
    busy: AtomicBool,
    phase: Mutex<AgentPhase>,
    current: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

/// Runs prompts against a terminal session
#[derive(Clone)]
pub struct AgentLoop {
    inner: Arc<Inner>,
}

/// Clears the busy flag however the run ends
struct BusyGuard<'a>(&'a Inner);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set_phase(AgentPhase::Idle);
        if let Ok(mut current) = self.0.current.lock() {
            current.take();
        }
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

impl AgentLoop {
    /// Create the loop and the receiver for its events.
    ///
    /// Cancelling `shutdown` stops any running prompt at its next suspension
    /// point.
    pub fn new(
        completion: Arc<dyn CompletionService>,
        terminal: Arc<dyn TerminalAccess>,
        config: AgentConfig,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (events, events_rx) = mpsc::channel(AGENT_EVENT_CHANNEL_CAPACITY);
        let agent = Self {
            inner: Arc::new(Inner {
                completion,
                terminal,
                config,
                events,
                busy: AtomicBool::new(false),
                phase: Mutex::new(AgentPhase::Idle),
                current: Mutex::new(None),
                shutdown,
            }),
        };
        (agent, events_rx)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> AgentPhase {
        self.inner
            .phase
            .lock()
            .map(|phase| *phase)
            .unwrap_or_default()
    }

    /// Start a prompt in the background.
    ///
    /// Fails right away with [`AgentError::Busy`] while another prompt runs
    /// and with [`AgentError::NoSession`] when there is nothing to drive.
    /// Progress and the outcome arrive as [`AgentEvent`]s.
    pub async fn handle_prompt(
        &self,
        prompt: String,
        session: Option<SessionId>,
    ) -> Result<tokio::task::JoinHandle<()>, AgentError> {
        let (session, cancel) = self.acquire(session).await?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let _guard = BusyGuard(&this.inner);
            let outcome = this.inner.run(&prompt, &session, &cancel).await;
            this.inner.report(outcome).await;
        }))
    }

    /// Run a prompt to completion on the current task
    pub async fn run_prompt(
        &self,
        prompt: &str,
        session: Option<SessionId>,
    ) -> Result<u32, AgentError> {
        let (session, cancel) = self.acquire(session).await?;
        let _guard = BusyGuard(&self.inner);
        self.inner.run(prompt, &session, &cancel).await
    }

    /// Cancel the running prompt, if any
    pub fn cancel(&self) -> bool {
        let current = self.inner.current.lock().ok().and_then(|c| c.clone());
        match current {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn acquire(
        &self,
        session: Option<SessionId>,
    ) -> Result<(SessionId, CancellationToken), AgentError> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AgentError::Busy);
        }

        let session = match session {
            Some(id) => Some(id),
            None => self.inner.terminal.default_session().await,
        };
        let Some(session) = session else {
            self.inner.busy.store(false, Ordering::SeqCst);
            return Err(AgentError::NoSession);
        };

        let cancel = self.inner.shutdown.child_token();
        if let Ok(mut current) = self.inner.current.lock() {
            *current = Some(cancel.clone());
        }
        Ok((session, cancel))
    }
}

impl Inner {
    fn set_phase(&self, phase: AgentPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    async fn emit(&self, event: AgentEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Agent event receiver dropped");
        }
    }

    async fn report(&self, outcome: Result<u32, AgentError>) {
        match outcome {
            Ok(turns) => {
                tracing::info!(turns, "Agent prompt complete");
                self.emit(AgentEvent::Complete { turns }).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Agent prompt failed");
                let raw = e.raw().map(str::to_string);
                self.emit(AgentEvent::Error {
                    error: e.to_string(),
                    raw,
                })
                .await;
            }
        }
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), AgentError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn capture(
        &self,
        session: &SessionId,
        window: ScreenWindow,
    ) -> Result<ScreenCapture, AgentError> {
        self.set_phase(AgentPhase::Capturing);
        self.terminal
            .capture(session, window)
            .await
            .map_err(|_| AgentError::NoSession)
    }

    async fn run(
        &self,
        prompt: &str,
        session: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<u32, AgentError> {
        tracing::info!(session = %session, "Agent prompt started");
        let mut conversation = Conversation::new(self.config.max_history);

        let capture = self
            .capture(session, ScreenWindow::recent(self.config.screen_chars))
            .await?;
        conversation.push_user(initial_message(prompt, &capture));
        let mut screen_id = capture.screen_id.to_string();

        let mut turns = 0u32;
        loop {
            if turns >= self.config.max_turns {
                return Err(AgentError::TurnLimit(self.config.max_turns));
            }
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            turns += 1;

            self.set_phase(AgentPhase::AwaitingCompletion);
            tracing::debug!(turn = turns, screen_id = %screen_id, "Requesting agent turn");
            let request = CompletionRequest {
                system_prompt: SYSTEM_PROMPT.to_string(),
                messages: conversation.messages().to_vec(),
                screen_id: Some(screen_id.clone()),
            };
            // An in-flight call is not interrupted; its result is dropped
            let raw = self.completion.complete(request).await?;
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let response = parse_response(&raw)?;
            conversation.push_assistant(raw);
            if let Some(thinking) = response.thinking.filter(|t| !t.trim().is_empty()) {
                self.emit(AgentEvent::Thinking(thinking)).await;
            }

            self.set_phase(AgentPhase::Executing);
            for action in &response.actions {
                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                self.emit(AgentEvent::Action(action.clone())).await;
                match action {
                    Action::Keystroke { value } => {
                        if !self.terminal.write(session, value.as_bytes()).await {
                            return Err(AgentError::NoSession);
                        }
                    }
                    Action::Delay { ms } => {
                        let delay = Duration::from_millis(*ms).min(self.config.max_delay);
                        self.sleep(delay, cancel).await?;
                    }
                    Action::Message { text } => {
                        self.emit(AgentEvent::Message(text.clone())).await;
                    }
                    // Deferred until the turn is over
                    Action::RequestScreen { .. } => {}
                }
            }

            let Some(window) = response
                .actions
                .last()
                .and_then(|last| last.screen_window(self.config.screen_chars))
            else {
                return Ok(turns);
            };

            self.sleep(self.config.settle_delay, cancel).await?;
            let capture = self.capture(session, window).await?;
            screen_id = capture.screen_id.to_string();
            conversation.push_user(screen_message(&capture));
        }
    }
}

fn initial_message(prompt: &str, capture: &ScreenCapture) -> String {
    format!(
        "Request: {}\n\nScreen {} (last {} of {} characters):\n{}",
        prompt,
        capture.screen_id,
        capture.text.chars().count(),
        capture.total_chars,
        capture.text
    )
}

fn screen_message(capture: &ScreenCapture) -> String {
    format!(
        "Screen {} ({} of {} characters):\n{}",
        capture.screen_id,
        capture.text.chars().count(),
        capture.total_chars,
        capture.text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tether_core::error::SessionError;

    use crate::pty::OutputBuffer;

    /// Completion service replaying canned replies
    struct Scripted {
        replies: Mutex<VecDeque<String>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionService for Scripted {
        async fn complete(&self, request: CompletionRequest) -> Result<String, AgentError> {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::Completion("script exhausted".to_string()))
        }
    }

    /// Terminal whose screen grows with every write
    struct FakeTerminal {
        buffer: Mutex<OutputBuffer>,
        writes: Mutex<Vec<String>>,
        captures: Mutex<Vec<ScreenWindow>>,
    }

    impl FakeTerminal {
        fn new() -> Arc<Self> {
            let mut buffer = OutputBuffer::new(4096);
            buffer.append(b"$ ");
            Arc::new(Self {
                buffer: Mutex::new(buffer),
                writes: Mutex::new(Vec::new()),
                captures: Mutex::new(Vec::new()),
            })
        }

        fn writes(&self) -> Vec<String> {
            self.writes.lock().unwrap().clone()
        }

        fn captures(&self) -> Vec<ScreenWindow> {
            self.captures.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TerminalAccess for FakeTerminal {
        async fn default_session(&self) -> Option<SessionId> {
            Some(SessionId::from("main"))
        }

        async fn write(&self, id: &SessionId, data: &[u8]) -> bool {
            if id.as_str() != "main" {
                return false;
            }
            self.writes
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(data).into_owned());
            self.buffer.lock().unwrap().append(data);
            true
        }

        async fn capture(
            &self,
            id: &SessionId,
            window: ScreenWindow,
        ) -> Result<ScreenCapture, SessionError> {
            if id.as_str() != "main" {
                return Err(SessionError::UnknownSession(id.to_string()));
            }
            self.captures.lock().unwrap().push(window);
            let buffer = self.buffer.lock().unwrap();
            let text = buffer.contents();
            Ok(ScreenCapture {
                total_chars: text.chars().count(),
                text,
                screen_id: buffer.screen_id(),
            })
        }
    }

    fn fast_config() -> AgentConfig {
        AgentConfig {
            settle_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..AgentConfig::default()
        }
    }

    fn agent(
        replies: &[&str],
        config: AgentConfig,
    ) -> (
        AgentLoop,
        mpsc::Receiver<AgentEvent>,
        Arc<Scripted>,
        Arc<FakeTerminal>,
    ) {
        let completion = Scripted::new(replies);
        let terminal = FakeTerminal::new();
        let (agent, events) = AgentLoop::new(
            completion.clone(),
            terminal.clone(),
            config,
            CancellationToken::new(),
        );
        (agent, events, completion, terminal)
    }

    #[tokio::test]
    async fn test_keystroke_turn_ends_loop() {
        let (agent, _events, completion, terminal) = agent(
            &[
                r#"{"actions":[{"type":"keystroke","value":"ls\n"}]}"#,
                r#"{"actions":[]}"#,
            ],
            fast_config(),
        );

        let turns = agent.run_prompt("list files", None).await.unwrap();
        assert_eq!(turns, 1);
        assert_eq!(terminal.writes(), vec!["ls\n".to_string()]);
        assert_eq!(terminal.captures().len(), 1);
        assert_eq!(completion.requests().len(), 1);
        assert!(!agent.is_busy());
        assert_eq!(agent.phase(), AgentPhase::Idle);
    }

    #[tokio::test]
    async fn test_keystroke_then_empty_after_request_screen() {
        let (agent, _events, completion, terminal) = agent(
            &[
                r#"{"actions":[{"type":"keystroke","value":"ls\n"},{"type":"request_screen"}]}"#,
                r#"{"actions":[]}"#,
            ],
            fast_config(),
        );

        let turns = agent.run_prompt("list files", None).await.unwrap();
        assert_eq!(turns, 2);
        assert_eq!(terminal.writes(), vec!["ls\n".to_string()]);
        // Initial capture plus the requested one, nothing after the empty turn
        assert_eq!(terminal.captures().len(), 2);
        assert_eq!(completion.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_request_screen_gives_one_more_turn_with_new_screen_id() {
        let (agent, _events, completion, terminal) = agent(
            &[
                r#"{"actions":[{"type":"keystroke","value":"pwd\n"},{"type":"requestScreen","sliceStart":100}]}"#,
                r#"{"actions":[{"type":"message","text":"done"}]}"#,
            ],
            fast_config(),
        );

        let turns = agent.run_prompt("where am I", None).await.unwrap();
        assert_eq!(turns, 2);

        let requests = completion.requests();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].screen_id, requests[1].screen_id);
        assert_eq!(
            terminal.captures()[1],
            ScreenWindow { start: 100, end: 0 }
        );
        let last = requests[1].messages.last().unwrap();
        assert!(last.content.contains("pwd"));

        // Each screen message names the token it was captured under
        for request in &requests {
            let screen_id = request.screen_id.as_deref().unwrap();
            let message = request.messages.last().unwrap();
            assert!(message.content.contains(&format!("Screen {} (", screen_id)));
        }
    }

    #[tokio::test]
    async fn test_turn_limit() {
        let screen = r#"{"actions":[{"type":"request_screen"}]}"#;
        let config = AgentConfig {
            max_turns: 3,
            ..fast_config()
        };
        let (agent, _events, completion, _terminal) =
            agent(&[screen, screen, screen, screen], config);

        let err = agent.run_prompt("loop", None).await.unwrap_err();
        assert!(matches!(err, AgentError::TurnLimit(3)));
        assert_eq!(completion.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_parse_error_aborts_with_raw() {
        let (agent, _events, completion, terminal) =
            agent(&["I think you should run ls"], fast_config());

        match agent.run_prompt("list", None).await {
            Err(AgentError::Parse { raw, .. }) => assert_eq!(raw, "I think you should run ls"),
            other => panic!("expected parse error, got {:?}", other),
        }
        assert_eq!(completion.requests().len(), 1);
        assert!(terminal.writes().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_reported() {
        let (agent, mut events, _completion, _terminal) = agent(
            &[
                r#"{"thinking":"say hi","actions":[{"type":"message","text":"hi"},{"type":"delay","ms":60000}]}"#,
            ],
            fast_config(),
        );

        let handle = agent.handle_prompt("greet".to_string(), None).await.unwrap();
        handle.await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(received[0], AgentEvent::Thinking("say hi".to_string()));
        assert!(received.contains(&AgentEvent::Message("hi".to_string())));
        assert_eq!(
            received.last(),
            Some(&AgentEvent::Complete { turns: 1 })
        );
        assert!(!agent.is_busy());
    }

    #[tokio::test]
    async fn test_busy_rejects_second_prompt() {
        let (agent, mut events, _completion, _terminal) = agent(
            &[r#"{"actions":[{"type":"delay","ms":50}]}"#],
            AgentConfig {
                max_delay: Duration::from_secs(1),
                ..fast_config()
            },
        );

        let handle = agent.handle_prompt("first".to_string(), None).await.unwrap();
        assert!(agent.is_busy());
        assert!(matches!(
            agent.handle_prompt("second".to_string(), None).await,
            Err(AgentError::Busy)
        ));

        handle.await.unwrap();
        assert!(!agent.is_busy());
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(AgentEvent::Complete { turns: 1 }));
    }

    #[tokio::test]
    async fn test_cancel_stops_at_next_suspension() {
        let (agent, mut events, _completion, _terminal) = agent(
            &[r#"{"actions":[{"type":"delay","ms":60000}]}"#],
            AgentConfig {
                max_delay: Duration::from_secs(60),
                ..fast_config()
            },
        );

        let handle = agent.handle_prompt("wait".to_string(), None).await.unwrap();
        while agent.phase() != AgentPhase::Executing {
            tokio::task::yield_now().await;
        }
        assert!(agent.cancel());
        handle.await.unwrap();

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        match last {
            Some(AgentEvent::Error { error, .. }) => assert!(error.contains("cancelled")),
            other => panic!("expected cancellation error, got {:?}", other),
        }
        assert!(!agent.is_busy());
    }

    #[tokio::test]
    async fn test_unknown_session_is_no_session() {
        let (agent, _events, _completion, _terminal) =
            agent(&[r#"{"actions":[]}"#], fast_config());
        assert!(matches!(
            agent
                .run_prompt("x", Some(SessionId::from("missing")))
                .await,
            Err(AgentError::NoSession)
        ));
        assert!(!agent.is_busy());
    }

    #[test]
    fn test_agent_event_wire_names() {
        let event = AgentEvent::Action(Action::Keystroke {
            value: "ls\n".to_string(),
        })
        .to_event();
        let (action, payload) = event.into_parts().unwrap();
        assert_eq!(action, "ai:action");
        assert_eq!(payload["action"]["type"], "keystroke");

        let (action, payload) = AgentEvent::Error {
            error: "bad".to_string(),
            raw: Some("raw".to_string()),
        }
        .to_event()
        .into_parts()
        .unwrap();
        assert_eq!(action, "ai:error");
        assert_eq!(payload["raw"], "raw");
    }
}
