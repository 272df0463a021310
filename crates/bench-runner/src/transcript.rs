use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bench_core::{atomic_write_json_pretty, Message, MessageContent, Role};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Destination for messages as a conversation produces them.
pub trait TranscriptSink: Send {
    fn append_messages(&mut self, messages: &[Message]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlTranscriptSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTranscriptSink {
    /// Opens `path` fresh; a previous run's transcript is truncated.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("failed to create transcript {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TranscriptSink for JsonlTranscriptSink {
    fn append_messages(&mut self, messages: &[Message]) -> Result<()> {
        for message in messages {
            append_row(&mut self.writer, message)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}

pub fn load_transcript(path: &Path) -> Result<Vec<Message>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open transcript {}", path.display()))?;
    let mut messages = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message: Message = serde_json::from_str(&line)
            .map_err(|e| anyhow!("{}:{}: {}", path.display(), idx + 1, e))?;
        messages.push(message);
    }
    Ok(messages)
}

fn image_extension(mime: &str) -> &str {
    match mime.strip_prefix("image/") {
        Some("jpeg") => "jpg",
        Some(ext) if !ext.is_empty() => ext,
        _ => "bin",
    }
}

/// Writes `<stem>.json` and dumps images found in multimodal tool output
/// as `<stem>_stepNNpic.<ext>` next to it.
pub fn save_messages(dir: &Path, stem: &str, messages: &[Message]) -> Result<PathBuf> {
    let path = dir.join(format!("{}.json", stem));
    atomic_write_json_pretty(&path, messages)?;

    for (step, message) in messages.iter().enumerate() {
        if message.role != Role::Tool {
            continue;
        }
        let Some(MessageContent::Parts(parts)) = &message.content else {
            continue;
        };
        for part in parts.iter().filter(|p| p.m_type.starts_with("image/")) {
            let image_path = dir.join(format!(
                "{}_step{:02}pic.{}",
                stem,
                step,
                image_extension(&part.m_type)
            ));
            match BASE64_STANDARD.decode(part.m_content.as_bytes()) {
                Ok(bytes) => fs::write(&image_path, bytes)?,
                Err(err) => warn!(step, "skipping undecodable image: {}", err),
            }
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TempDirGuard;
    use bench_core::{ContentPart, FunctionCall, ToolCall};

    fn sample_conversation() -> Vec<Message> {
        let mut assistant = Message::assistant("looking around");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_1".to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: "cat".to_string(),
                arguments: "{\"paths\":\"src/lib.rs\"}".to_string(),
            },
        }]);
        let mut tool = Message::new(Role::Tool, "fn main() {}");
        tool.tool_call_id = Some("call_1".to_string());
        vec![Message::user("fix the bug"), assistant, tool]
    }

    #[test]
    fn transcript_round_trip_preserves_order_and_tool_calls() {
        let root = TempDirGuard::new("transcript_roundtrip");
        let path = root.path.join("task.transcript.jsonl");
        let messages = sample_conversation();
        {
            let mut sink = JsonlTranscriptSink::create(&path).expect("sink");
            sink.append_messages(&messages[..1]).expect("first turn");
            sink.flush().expect("flush");
            sink.append_messages(&messages[1..]).expect("second turn");
            sink.flush().expect("flush");
        }
        let reloaded = load_transcript(&path).expect("reload");
        assert_eq!(reloaded, messages);
    }

    #[test]
    fn flushed_turns_are_visible_before_the_sink_closes() {
        let root = TempDirGuard::new("transcript_flush");
        let path = root.path.join("t.jsonl");
        let mut sink = JsonlTranscriptSink::create(&path).expect("sink");
        sink.append_messages(&sample_conversation()).expect("append");
        sink.flush().expect("flush");
        assert_eq!(load_transcript(sink.path()).expect("reload").len(), 3);
    }

    #[test]
    fn save_messages_extracts_tool_images() {
        let root = TempDirGuard::new("transcript_images");
        let mut tool = Message::new(Role::Tool, "");
        tool.content = Some(MessageContent::Parts(vec![
            ContentPart {
                m_type: "text".to_string(),
                m_content: "screenshot".to_string(),
            },
            ContentPart {
                m_type: "image/png".to_string(),
                m_content: BASE64_STANDARD.encode(b"png-bytes"),
            },
        ]));
        let messages = vec![Message::user("look"), tool];
        let path = save_messages(&root.path, "task", &messages).expect("save");
        assert!(path.ends_with("task.json"));
        let image = fs::read(root.path.join("task_step01pic.png")).expect("image written");
        assert_eq!(image, b"png-bytes");
    }
}
