use crate::backend::{ChatRequest, InferenceBackend};
use crate::guard;
use crate::transcript::TranscriptSink;
use anyhow::Result;
use bench_core::{BenchError, Message};
use tracing::{debug, info, warn};

pub const STANDARD_MAX_TOKENS: u32 = 4096;
/// Extended reasoning spends part of the budget thinking, so it gets twice as much.
pub const BOOSTED_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub model: String,
    pub max_steps: usize,
    pub boost_thinking: bool,
    pub temperature: f32,
    pub chat_id: String,
    pub chat_remote: bool,
    pub domain: String,
}

impl ConversationSettings {
    fn request(&self, messages: Vec<Message>, tools: &[serde_json::Value]) -> ChatRequest {
        let (max_tokens, stream) = if self.boost_thinking {
            (BOOSTED_MAX_TOKENS, false)
        } else {
            (STANDARD_MAX_TOKENS, true)
        };
        ChatRequest {
            messages,
            tools: tools.to_vec(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens,
            stream,
            n: 1,
            chat_id: self.chat_id.clone(),
            chat_remote: self.chat_remote,
            boost_thinking: self.boost_thinking,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The agent stopped calling tools.
    Completed { turns: usize },
    BudgetExhausted { turns: usize },
}

#[derive(Debug, Clone)]
pub struct ConversationOutcome {
    pub messages: Vec<Message>,
    pub termination: Termination,
    pub advisories: usize,
}

/// Runs turns against `backend` until the agent stops calling tools or
/// `max_steps` turns have been spent.
///
/// The initial messages and then every turn's new messages go to `sink`,
/// flushed before the next request.
pub async fn run_conversation(
    backend: &dyn InferenceBackend,
    initial: Vec<Message>,
    settings: &ConversationSettings,
    sink: &mut dyn TranscriptSink,
) -> Result<ConversationOutcome> {
    let tools = backend.fetch_tools().await?;
    debug!(tools = tools.len(), model = %settings.model, "starting conversation");
    let guarded = guard::applies_to(&settings.domain);

    sink.append_messages(&initial)?;
    sink.flush()?;

    let mut messages = initial;
    let mut written = messages.len();
    let mut advisories = 0;

    for turn in 1..=settings.max_steps {
        let request = settings.request(messages.clone(), &tools);
        let candidates = backend.chat(&request).await?;
        messages = candidates.into_iter().next().ok_or_else(|| {
            BenchError::Protocol(format!("backend returned no candidates on turn {}", turn))
        })?;

        sink.append_messages(messages.get(written..).unwrap_or(&[]))?;
        sink.flush()?;
        written = messages.len();

        let continues = messages.last().map(Message::has_tool_calls).unwrap_or(false);
        if !continues {
            info!(turns = turn, "conversation over: no more tool calls");
            return Ok(ConversationOutcome {
                messages,
                termination: Termination::Completed { turns: turn },
                advisories,
            });
        }

        if guarded {
            if let Some(kind) = guard::apply(&mut messages) {
                debug!(?kind, turn, "guard advisory injected");
                advisories += 1;
                sink.append_messages(&messages[written..])?;
                sink.flush()?;
                written = messages.len();
            }
        }
    }

    warn!(
        max_steps = settings.max_steps,
        "conversation over: out of turns"
    );
    Ok(ConversationOutcome {
        messages,
        termination: Termination::BudgetExhausted {
            turns: settings.max_steps,
        },
        advisories,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tool_call_message, MemoryTranscriptSink, ScriptedBackend};
    use bench_core::{AdvisoryKind, ErrorKind, Role};

    fn settings(max_steps: usize, boost_thinking: bool, domain: &str) -> ConversationSettings {
        ConversationSettings {
            model: "test-model".to_string(),
            max_steps,
            boost_thinking,
            temperature: 0.0,
            chat_id: "bench-0000000000".to_string(),
            chat_remote: false,
            domain: domain.to_string(),
        }
    }

    #[tokio::test]
    async fn budget_exhaustion_is_not_an_error() {
        let backend = ScriptedBackend::repeating(tool_call_message(&["cat"]));
        let mut sink = MemoryTranscriptSink::default();
        let outcome = run_conversation(
            &backend,
            vec![Message::user("fix")],
            &settings(3, false, "other"),
            &mut sink,
        )
        .await
        .expect("conversation");

        assert_eq!(outcome.termination, Termination::BudgetExhausted { turns: 3 });
        assert_eq!(backend.requests().len(), 3);
        assert_eq!(outcome.messages.len(), 4);
        assert_eq!(sink.messages, outcome.messages);
        assert_eq!(sink.flushes, 4);
    }

    #[tokio::test]
    async fn stops_when_the_agent_stops_calling_tools() {
        let backend = ScriptedBackend::new(vec![
            tool_call_message(&["tree"]),
            Message::assistant("patched"),
        ]);
        let mut sink = MemoryTranscriptSink::default();
        let outcome = run_conversation(
            &backend,
            vec![Message::user("fix")],
            &settings(30, false, "other"),
            &mut sink,
        )
        .await
        .expect("conversation");
        assert_eq!(outcome.termination, Termination::Completed { turns: 2 });
        assert_eq!(
            outcome.messages.last().and_then(Message::text).as_deref(),
            Some("patched")
        );
    }

    #[tokio::test]
    async fn generation_mode_controls_stream_and_budget() {
        for (boost, stream, max_tokens) in [
            (false, true, STANDARD_MAX_TOKENS),
            (true, false, BOOSTED_MAX_TOKENS),
        ] {
            let backend = ScriptedBackend::new(vec![Message::assistant("ok")]);
            let mut sink = MemoryTranscriptSink::default();
            run_conversation(
                &backend,
                vec![Message::user("q")],
                &settings(5, boost, "other"),
                &mut sink,
            )
            .await
            .expect("conversation");
            let requests = backend.requests();
            assert_eq!(requests[0].stream, stream);
            assert_eq!(requests[0].max_tokens, max_tokens);
            assert_eq!(requests[0].n, 1);
        }
    }

    #[tokio::test]
    async fn no_candidates_is_a_protocol_error() {
        let backend = ScriptedBackend::new(Vec::new());
        let mut sink = MemoryTranscriptSink::default();
        let err = run_conversation(
            &backend,
            vec![Message::user("q")],
            &settings(5, false, "other"),
            &mut sink,
        )
        .await
        .expect_err("should fail");
        assert_eq!(BenchError::classify(&err), Some(ErrorKind::Protocol));
    }

    #[tokio::test]
    async fn advisory_reaches_the_next_request() {
        let backend = ScriptedBackend::new(vec![
            tool_call_message(&["cat"]),
            tool_call_message(&["debug_script"]),
            tool_call_message(&["strategic_planning"]),
            tool_call_message(&["critique"]),
            tool_call_message(&["shell", "shell", "shell", "shell", "shell"]),
            Message::assistant("done"),
        ]);
        let mut sink = MemoryTranscriptSink::default();
        let outcome = run_conversation(
            &backend,
            vec![Message::user("fix")],
            &settings(10, false, guard::GUARDED_DOMAIN),
            &mut sink,
        )
        .await
        .expect("conversation");

        assert_eq!(outcome.advisories, 1);
        let requests = backend.requests();
        let last_request = requests.last().expect("request");
        let advisory = last_request.messages.last().expect("advisory");
        assert_eq!(advisory.role, Role::CdInstruction);
        assert_eq!(advisory.advisory, Some(AdvisoryKind::PreferDebugger));
        assert_eq!(sink.messages, outcome.messages);
    }
}
