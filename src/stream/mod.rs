//! The dispatch streaming state machine.
//!
//! Every dispatch emits exactly one `start`, then zero or more `token`
//! events, then exactly one terminal event: `end` once the assistant turn is
//! durably recorded, or `error` if anything failed before that point. The
//! handler runs to completion before the first token goes out, so the token
//! stream is a paced replay of finished output, not live generation.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::engine::context::ExecutionContext;
use crate::engine::handler::PhaseHandler;
use crate::errors::EngineError;
use crate::store::{DbHandle, Message};

/// One wire event. Serialized as `{"type": ...}` tagged JSON; `messageId`
/// keeps the camelCase spelling clients already parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start,
    Token {
        content: String,
    },
    End {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Error {
        message: String,
    },
}

/// How finished handler output is sliced into `token` events. Every mode
/// preserves the text byte for byte: concatenating the chunks reproduces the
/// original exactly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// One event per character. Slowest, smoothest.
    Char,
    /// One event per whitespace-terminated word.
    Word,
    /// One event per line.
    Line,
}

impl ChunkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Char => "char",
            Self::Word => "word",
            Self::Line => "line",
        }
    }

    pub fn chunks(&self, text: &str) -> Vec<String> {
        match self {
            Self::Char => text.chars().map(String::from).collect(),
            Self::Word => text
                .split_inclusive(char::is_whitespace)
                .map(str::to_string)
                .collect(),
            Self::Line => text.split_inclusive('\n').map(str::to_string).collect(),
        }
    }
}

impl FromStr for ChunkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "char" => Ok(Self::Char),
            "word" => Ok(Self::Word),
            "line" => Ok(Self::Line),
            _ => Err(format!("Invalid chunk mode: {}", s)),
        }
    }
}

/// Runs one dispatch end to end: handler execution, token replay, and the
/// atomic persistence of the assistant turn.
#[derive(Clone)]
pub struct StreamingExecutor {
    db: DbHandle,
    config: EngineConfig,
}

impl StreamingExecutor {
    pub fn new(db: DbHandle, config: EngineConfig) -> Self {
        Self { db, config }
    }

    /// Drive one dispatch, sending events on `tx`.
    ///
    /// A send failure means the listener hung up; the dispatch stops where it
    /// is, nothing is persisted for the assistant turn, and no terminal event
    /// is attempted. The caller's user message was recorded before dispatch
    /// and survives regardless.
    pub async fn run(
        &self,
        project_id: &str,
        phase: i64,
        handler: Arc<dyn PhaseHandler>,
        ctx: ExecutionContext,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<Message, EngineError> {
        if tx.send(StreamEvent::Start).await.is_err() {
            return Err(EngineError::StreamAborted);
        }

        let outcome = match tokio::time::timeout(self.config.handler_timeout(), handler.execute(&ctx))
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let err = EngineError::HandlerFailed {
                    phase,
                    message: e.to_string(),
                };
                self.send_error(&tx, &err).await;
                return Err(err);
            }
            Err(_) => {
                let err = EngineError::Timeout {
                    phase,
                    seconds: self.config.handler_timeout_secs,
                };
                self.send_error(&tx, &err).await;
                return Err(err);
            }
        };

        debug!(
            phase,
            handler = handler.name(),
            status = %outcome.status,
            chars = outcome.text.len(),
            "handler finished, replaying output"
        );

        let delay = self.config.token_delay();
        for chunk in self.config.chunk_mode.chunks(&outcome.text) {
            if tx.send(StreamEvent::Token { content: chunk }).await.is_err() {
                warn!(phase, "listener disconnected mid-stream, dropping turn");
                return Err(EngineError::StreamAborted);
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let pid = project_id.to_string();
        let content = outcome.text.clone();
        let artifacts = outcome.artifacts.clone();
        let recorded = self
            .db
            .call(move |db| db.record_assistant_turn(&pid, phase, &content, &artifacts))
            .await;
        let (message, files) = match recorded {
            Ok(pair) => pair,
            Err(e) => {
                let err = EngineError::Database(e);
                self.send_error(&tx, &err).await;
                return Err(err);
            }
        };
        if !files.is_empty() {
            debug!(phase, files = files.len(), "reconciled generated files");
        }

        if tx
            .send(StreamEvent::End {
                message_id: message.id.clone(),
            })
            .await
            .is_err()
        {
            // Turn is already durable; only the notification was lost.
            return Err(EngineError::StreamAborted);
        }
        Ok(message)
    }

    async fn send_error(&self, tx: &mpsc::Sender<StreamEvent>, err: &EngineError) {
        let _ = tx
            .send(StreamEvent::Error {
                message: err.to_string(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::Outcome;
    use crate::store::{EngineDb, Role};
    use async_trait::async_trait;

    struct FixedHandler(&'static str);

    #[async_trait]
    impl PhaseHandler for FixedHandler {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<Outcome, EngineError> {
            Ok(Outcome::success(self.0))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl PhaseHandler for FailingHandler {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<Outcome, EngineError> {
            Err(EngineError::UnknownHandler {
                name: "inner".into(),
            })
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl PhaseHandler for SlowHandler {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<Outcome, EngineError> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(Outcome::success("never"))
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            token_delay_ms: 0,
            ..EngineConfig::default()
        }
    }

    async fn setup() -> (StreamingExecutor, DbHandle, String) {
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        let project = db
            .call(|db| db.create_project("Demo", "", "u"))
            .await
            .unwrap();
        let executor = StreamingExecutor::new(db.clone(), fast_config());
        (executor, db, project.id)
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn stream_shape_is_start_tokens_end() {
        let (executor, _db, project_id) = setup().await;
        let ctx = ExecutionContext::new(&project_id, "Demo", "hi");
        let (tx, rx) = mpsc::channel(256);

        let pid = project_id.clone();
        let run = tokio::spawn(async move {
            executor
                .run(&pid, 1, Arc::new(FixedHandler("hello world")), ctx, tx)
                .await
        });
        let events = collect(rx).await;
        let message = run.await.unwrap().unwrap();

        assert_eq!(events.first(), Some(&StreamEvent::Start));
        assert!(matches!(events.last(), Some(StreamEvent::End { message_id }) if *message_id == message.id));
        for ev in &events[1..events.len() - 1] {
            assert!(matches!(ev, StreamEvent::Token { .. }));
        }
    }

    #[tokio::test]
    async fn tokens_concatenate_to_persisted_content() {
        for mode in [ChunkMode::Char, ChunkMode::Word, ChunkMode::Line] {
            let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
            let project = db
                .call(|db| db.create_project("Demo", "", "u"))
                .await
                .unwrap();
            let config = EngineConfig {
                chunk_mode: mode,
                token_delay_ms: 0,
                ..EngineConfig::default()
            };
            let executor = StreamingExecutor::new(db.clone(), config);

            let text = "line one\n  spaced   words\nlast";
            let ctx = ExecutionContext::new(&project.id, "Demo", "hi");
            let (tx, rx) = mpsc::channel(256);
            let pid = project.id.clone();
            let run = tokio::spawn(async move {
                executor.run(&pid, 1, Arc::new(FixedHandler(text)), ctx, tx).await
            });
            let events = collect(rx).await;
            let message = run.await.unwrap().unwrap();

            let concatenated: String = events
                .iter()
                .filter_map(|ev| match ev {
                    StreamEvent::Token { content } => Some(content.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(concatenated, text, "mode {:?}", mode);
            assert_eq!(message.content, text);

            let pid = project.id.clone();
            let log = db.call(move |db| db.list_messages(&pid)).await.unwrap();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].content, text);
        }
    }

    #[tokio::test]
    async fn handler_failure_ends_with_error_and_persists_nothing() {
        let (executor, db, project_id) = setup().await;
        let pid = project_id.clone();
        db.call(move |db| db.append_message(&pid, 1, Role::User, "hi"))
            .await
            .unwrap();

        let ctx = ExecutionContext::new(&project_id, "Demo", "hi");
        let (tx, rx) = mpsc::channel(256);
        let pid = project_id.clone();
        let run = tokio::spawn(async move {
            executor.run(&pid, 1, Arc::new(FailingHandler), ctx, tx).await
        });
        let events = collect(rx).await;
        let err = run.await.unwrap().unwrap_err();

        assert!(matches!(err, EngineError::HandlerFailed { phase: 1, .. }));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Start);
        assert!(matches!(events[1], StreamEvent::Error { .. }));

        // The pre-dispatch user message survives; no assistant row was added.
        let pid = project_id.clone();
        let log = db.call(move |db| db.list_messages(&pid)).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].role, Role::User);
    }

    #[tokio::test]
    async fn timeout_ends_with_error() {
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        let project = db
            .call(|db| db.create_project("Demo", "", "u"))
            .await
            .unwrap();
        let config = EngineConfig {
            handler_timeout_secs: 0,
            token_delay_ms: 0,
            ..EngineConfig::default()
        };
        let executor = StreamingExecutor::new(db.clone(), config);

        let ctx = ExecutionContext::new(&project.id, "Demo", "hi");
        let (tx, rx) = mpsc::channel(256);
        let pid = project.id.clone();
        let run =
            tokio::spawn(async move { executor.run(&pid, 3, Arc::new(SlowHandler), ctx, tx).await });
        let events = collect(rx).await;
        let err = run.await.unwrap().unwrap_err();

        assert!(matches!(err, EngineError::Timeout { phase: 3, .. }));
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn dropped_listener_aborts_without_persisting() {
        let (executor, db, project_id) = setup().await;
        let ctx = ExecutionContext::new(&project_id, "Demo", "hi");
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let err = executor
            .run(&project_id, 1, Arc::new(FixedHandler("hello")), ctx, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StreamAborted));

        let pid = project_id.clone();
        let log = db.call(move |db| db.list_messages(&pid)).await.unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn chunk_modes_preserve_bytes() {
        let text = "a b\nc  d\n\ne";
        for mode in [ChunkMode::Char, ChunkMode::Word, ChunkMode::Line] {
            let joined: String = mode.chunks(text).concat();
            assert_eq!(joined, text, "mode {:?}", mode);
        }
        assert!(ChunkMode::Char.chunks("").is_empty());
    }

    #[test]
    fn events_serialize_to_the_wire_shape() {
        assert_eq!(
            serde_json::to_string(&StreamEvent::Start).unwrap(),
            r#"{"type":"start"}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamEvent::Token { content: "hi".into() }).unwrap(),
            r#"{"type":"token","content":"hi"}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamEvent::End { message_id: "m1".into() }).unwrap(),
            r#"{"type":"end","messageId":"m1"}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamEvent::Error { message: "boom".into() }).unwrap(),
            r#"{"type":"error","message":"boom"}"#
        );
    }
}
