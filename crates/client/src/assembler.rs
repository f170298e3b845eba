//! Rebuilds render-ready messages from the assistant's structured output.
//!
//! Input is the NDJSON carried by `assistant.chunk` frames, in arbitrary
//! pieces. Lines are reassembled from bytes, so a chunk boundary may fall
//! anywhere, including inside a multi-byte character.

use serde_json::Value;
use tracing::debug;

use relaydock_protocol::{ContentBlock, MessageRole, StreamingMessage, ToolInput};

/// Change produced by feeding stream data
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerUpdate {
    /// The in-progress message changed
    Updated(StreamingMessage),
    /// A message finished streaming
    Completed(StreamingMessage),
}

impl AssemblerUpdate {
    pub fn message(&self) -> &StreamingMessage {
        match self {
            AssemblerUpdate::Updated(message) | AssemblerUpdate::Completed(message) => message,
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamAssembler {
    buffer: Vec<u8>,
    current: Option<StreamingMessage>,
    last_completed: Option<String>,
    implicit_ids: u64,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The message currently streaming, if any.
    pub fn current(&self) -> Option<&StreamingMessage> {
        self.current.as_ref()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<AssemblerUpdate> {
        self.push_bytes(chunk.as_bytes())
    }

    /// Feed raw bytes; complete lines are processed, the remainder buffered.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<AssemblerUpdate> {
        self.buffer.extend_from_slice(chunk);
        let mut updates = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line[..line.len() - 1], &mut updates);
        }
        updates
    }

    /// Process a trailing line that never got its newline.
    pub fn finish(&mut self) -> Vec<AssemblerUpdate> {
        let line = std::mem::take(&mut self.buffer);
        let mut updates = Vec::new();
        self.process_line(&line, &mut updates);
        updates
    }

    /// Drop buffered bytes and the in-progress message.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.current = None;
        self.last_completed = None;
    }

    fn process_line(&mut self, line: &[u8], updates: &mut Vec<AssemblerUpdate>) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        let raw: Value = match serde_json::from_slice(line) {
            Ok(value) => value,
            Err(e) => {
                debug!(
                    component = "stream_assembler",
                    event = "assembler.line.invalid",
                    error = %e,
                    "Skipping malformed stream line"
                );
                return;
            }
        };
        self.apply(&raw, updates);
    }

    fn apply(&mut self, raw: &Value, updates: &mut Vec<AssemblerUpdate>) {
        let event_type = raw.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match event_type {
            "stream_event" => {
                if let Some(event) = raw.get("event") {
                    self.apply(event, updates);
                }
            }
            "assistant" | "message_start" => {
                if let Some(message) = raw.get("message") {
                    self.open_message(message);
                    self.push_current(updates);
                }
            }
            "content_block_start" => {
                let index = block_index(raw);
                let seeded = raw.get("content_block").and_then(block_from_start);
                if let Some(block) = seeded.filter(|_| self.accepts_index(index)) {
                    if let Some(target) = slot(self.ensure_current(), index) {
                        *target = block;
                        self.push_current(updates);
                    }
                }
            }
            "content_block_delta" => {
                let index = block_index(raw);
                let Some(delta) = raw.get("delta") else {
                    return;
                };
                if !self.accepts_index(index) {
                    return;
                }
                let applied = slot(self.ensure_current(), index)
                    .is_some_and(|target| apply_delta(target, delta));
                if applied {
                    self.push_current(updates);
                }
            }
            "content_block_stop" => {
                let index = block_index(raw);
                if let Some(block) = self
                    .current
                    .as_mut()
                    .and_then(|message| message.content.get_mut(index))
                {
                    finalize_tool_input(block);
                    self.push_current(updates);
                }
            }
            "message_stop" | "result" => {
                if let Some(mut message) = self.current.take() {
                    message.content.iter_mut().for_each(finalize_tool_input);
                    message.is_streaming = false;
                    self.last_completed = Some(message.id.clone());
                    updates.push(AssemblerUpdate::Completed(message));
                }
            }
            "user" => {
                if let Some(message) = raw.get("message").and_then(|m| self.user_message(m)) {
                    updates.push(AssemblerUpdate::Completed(message));
                }
            }
            _ => {}
        }
    }

    fn open_message(&mut self, message: &Value) {
        let id = message
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if id.is_some() && id == self.last_completed {
            // Snapshot of a message that already finished streaming.
            return;
        }
        let inline = message
            .get("content")
            .and_then(|v| v.as_array())
            .map(|blocks| blocks.iter().filter_map(block_from_inline).collect())
            .unwrap_or_else(Vec::new);

        if let (Some(current), Some(id)) = (self.current.as_mut(), id.as_ref()) {
            if current.id == *id {
                merge_blocks(current, inline);
                return;
            }
        }

        let id = id.unwrap_or_else(|| self.next_implicit_id());
        let mut opened = StreamingMessage::new(id, MessageRole::Assistant);
        opened.content = inline;
        self.current = Some(opened);
    }

    fn user_message(&mut self, message: &Value) -> Option<StreamingMessage> {
        let content: Vec<ContentBlock> = match message.get("content") {
            Some(Value::String(text)) => vec![ContentBlock::text(text.clone())],
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(block_from_inline)
                .collect(),
            _ => Vec::new(),
        };
        if content.is_empty() {
            return None;
        }
        let id = message
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.next_implicit_id());
        let mut completed = StreamingMessage::new(id, MessageRole::User);
        completed.content = content;
        completed.is_streaming = false;
        Some(completed)
    }

    /// Events that arrive with no open message start an implicit one.
    fn ensure_current(&mut self) -> &mut StreamingMessage {
        let counter = &mut self.implicit_ids;
        self.current.get_or_insert_with(|| {
            *counter += 1;
            StreamingMessage::new(format!("local-{counter}"), MessageRole::Assistant)
        })
    }

    fn next_implicit_id(&mut self) -> String {
        self.implicit_ids += 1;
        format!("local-{}", self.implicit_ids)
    }

    /// Block events may address an open block or the next one, nothing past it.
    fn accepts_index(&self, index: usize) -> bool {
        let open = self.current.as_ref().map_or(0, |m| m.content.len());
        if index <= open {
            return true;
        }
        debug!(
            component = "stream_assembler",
            event = "assembler.block.out_of_range",
            index,
            open,
            "Skipping block event past the open blocks"
        );
        false
    }

    fn push_current(&self, updates: &mut Vec<AssemblerUpdate>) {
        if let Some(message) = &self.current {
            updates.push(AssemblerUpdate::Updated(message.clone()));
        }
    }
}

fn block_index(raw: &Value) -> usize {
    raw.get("index")
        .and_then(|v| v.as_u64())
        .map_or(0, |i| usize::try_from(i).unwrap_or(usize::MAX))
}

/// Block at `index`; the next unused index opens an empty text block.
fn slot(message: &mut StreamingMessage, index: usize) -> Option<&mut ContentBlock> {
    if index == message.content.len() {
        message.content.push(ContentBlock::text(""));
    }
    message.content.get_mut(index)
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn block_from_start(block: &Value) -> Option<ContentBlock> {
    match block.get("type").and_then(|v| v.as_str())? {
        "text" => Some(ContentBlock::Text {
            text: str_field(block, "text"),
        }),
        "thinking" => Some(ContentBlock::Thinking {
            thinking: str_field(block, "thinking"),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: str_field(block, "id"),
            name: str_field(block, "name"),
            input: ToolInput::default(),
        }),
        _ => None,
    }
}

fn block_from_inline(block: &Value) -> Option<ContentBlock> {
    match block.get("type").and_then(|v| v.as_str())? {
        "tool_use" => Some(ContentBlock::ToolUse {
            id: str_field(block, "id"),
            name: str_field(block, "name"),
            input: ToolInput::Parsed(
                block
                    .get("input")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default())),
            ),
        }),
        _ => block_from_start(block),
    }
}

/// Add inline blocks not already present; streamed blocks keep their slots.
fn merge_blocks(message: &mut StreamingMessage, inline: Vec<ContentBlock>) {
    for block in inline {
        let present = message.content.iter_mut().find(|existing| same_block(existing, &block));
        match present {
            Some(existing) => {
                if let (
                    ContentBlock::ToolUse { input, .. },
                    ContentBlock::ToolUse {
                        input: final_input, ..
                    },
                ) = (existing, block)
                {
                    if !input.is_final() {
                        *input = final_input;
                    }
                }
            }
            None => message.content.push(block),
        }
    }
}

fn same_block(existing: &ContentBlock, incoming: &ContentBlock) -> bool {
    match (existing, incoming) {
        (ContentBlock::ToolUse { id: a, .. }, ContentBlock::ToolUse { id: b, .. }) => a == b,
        (ContentBlock::Text { text: a }, ContentBlock::Text { text: b }) => a == b,
        (ContentBlock::Thinking { thinking: a }, ContentBlock::Thinking { thinking: b }) => a == b,
        _ => false,
    }
}

/// Returns whether the block changed.
fn apply_delta(block: &mut ContentBlock, delta: &Value) -> bool {
    let delta_type = delta.get("type").and_then(|v| v.as_str()).unwrap_or("");
    // A thinking delta landing on an unseeded slot claims it.
    if delta_type == "thinking_delta"
        && matches!(block, ContentBlock::Text { text } if text.is_empty())
    {
        *block = ContentBlock::Thinking {
            thinking: String::new(),
        };
    }

    let field = match delta_type {
        "text_delta" => "text",
        "thinking_delta" => "thinking",
        "input_json_delta" => "partial_json",
        _ => return false,
    };
    let piece = delta.get(field).and_then(|v| v.as_str()).unwrap_or("");

    match (delta_type, block) {
        ("text_delta", ContentBlock::Text { text }) => text.push_str(piece),
        ("thinking_delta", ContentBlock::Thinking { thinking }) => thinking.push_str(piece),
        (
            "input_json_delta",
            ContentBlock::ToolUse {
                input: ToolInput::Accumulating(partial),
                ..
            },
        ) => partial.push_str(piece),
        _ => return false,
    }
    true
}

fn finalize_tool_input(block: &mut ContentBlock) {
    let ContentBlock::ToolUse { input, .. } = block else {
        return;
    };
    let ToolInput::Accumulating(partial) = input else {
        return;
    };
    let text = std::mem::take(partial);
    *input = if text.trim().is_empty() {
        ToolInput::Parsed(Value::Object(Default::default()))
    } else {
        match serde_json::from_str(&text) {
            Ok(value) => ToolInput::Parsed(value),
            Err(_) => ToolInput::Raw(text),
        }
    };
}
