//! Stream normalization engine.
//!
//! Consumes classified upstream events (SSE envelopes or decoded RPC
//! messages) and produces normalized chunks: a role announcement on the
//! first delta, content and reasoning fragments, a trailing citation block,
//! and exactly one terminal `stop` chunk per logical stream no matter how
//! many terminal-like signals the upstream emits.

mod policy;

pub use policy::{CitationStyle, OutputPolicy, ThinkingStyle};

use std::collections::HashSet;

use bytes::Bytes;

use chat2api_protocol::connect::RpcMessage;
use chat2api_protocol::event::{ChatEvent, SearchResult, Section};
use chat2api_protocol::openai::{
    ChatCompletion, ChatCompletionChunk, ChunkObjectType, Citation, CompletionChoice,
    CompletionObjectType, FinishReason, MessageDelta, ResponseMessage, Role, StreamChoice, Usage,
};
use chat2api_protocol::sse;

const FOLD_OPEN: &str = "<details><summary>思考过程</summary><pre>";
const FOLD_CLOSE: &str = "</pre></details>";
const CITATION_HEADING: &str = "\n\n**参考资料**:\n";

/// Per-stream mutable transcoding state.
///
/// Created when the first upstream byte arrives, dropped when the stream
/// terminates. One instance per stream; instances share nothing.
#[derive(Debug)]
pub struct StreamTranscoder {
    session_id: String,
    message_id: String,
    model: String,
    created: i64,
    policy: OutputPolicy,
    section: Option<Section>,
    search_results: Vec<SearchResult>,
    content: String,
    reasoning: String,
    role_emitted: bool,
    fold_open: bool,
    finished: bool,
}

impl StreamTranscoder {
    pub fn new(model: &str, session_id: &str, policy: OutputPolicy, created: i64) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_id: String::new(),
            model: model.to_string(),
            created,
            policy,
            section: None,
            search_results: Vec::new(),
            content: String::new(),
            reasoning: String::new(),
            role_emitted: false,
            fold_open: false,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Applies one classified event; returns zero or more chunks to emit.
    /// Events arriving after the terminal chunk are ignored.
    pub fn push(&mut self, event: ChatEvent) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        match event {
            ChatEvent::MessageId(id) => {
                if self.message_id.is_empty() {
                    self.message_id = id;
                }
                Vec::new()
            }
            ChatEvent::Section(section) => {
                self.section = Some(section);
                Vec::new()
            }
            ChatEvent::SearchResults(rows) => {
                self.search_results = rows;
                Vec::new()
            }
            ChatEvent::CiteIndexPatch(patches) => {
                // Last write wins per index; patches are idempotent.
                for patch in patches {
                    if let Some(row) = self.search_results.get_mut(patch.index) {
                        row.cite_index = Some(patch.cite_index);
                    }
                }
                Vec::new()
            }
            ChatEvent::Fragment(text) => self.fragment(&text),
            ChatEvent::Done => self.terminal(),
        }
    }

    /// Feeds one decoded RPC message through the same state machine.
    pub fn push_rpc(&mut self, message: &RpcMessage) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some(info) = &message.message
            && info.role.as_deref() == Some("assistant")
            && self.message_id.is_empty()
            && let Some(id) = &info.id
        {
            self.message_id = id.clone();
        }
        if message.appends_text()
            && let Some(text) = message.text_content()
        {
            let text = text.to_string();
            self.section = Some(Section::Content);
            out.extend(self.fragment(&text));
        }
        if message.done {
            out.extend(self.terminal());
        }
        out
    }

    /// Synthesizes the terminal sequence when the transport closes without
    /// an explicit terminal marker, so the caller never hangs.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        self.terminal()
    }

    /// Degrades a mid-stream failure to an in-band terminal delta.
    pub fn interrupt(&mut self, note: &str) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        if self.fold_open {
            out.push(self.close_fold());
        }
        out.push(self.content_chunk(note.to_string()));
        out.extend(self.terminal());
        out
    }

    /// Final accumulated result for the buffered (non-streaming) mode.
    pub fn into_completion(mut self) -> ChatCompletion {
        let reasoning = self.reasoning.trim().to_string();
        ChatCompletion {
            id: self.stream_id(),
            model: std::mem::take(&mut self.model),
            object: CompletionObjectType::ChatCompletion,
            choices: vec![CompletionChoice {
                index: 0,
                message: ResponseMessage {
                    role: Role::Assistant,
                    content: self.content.trim().to_string(),
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                },
                finish_reason: FinishReason::Stop,
            }],
            usage: placeholder_usage(),
            created: self.created,
        }
    }

    fn fragment(&mut self, raw: &str) -> Vec<ChatCompletionChunk> {
        let text = rewrite_citation_markers(raw, self.policy.citations == CitationStyle::Append);
        match self.section {
            Some(Section::Thinking) => match self.policy.thinking {
                ThinkingStyle::Silent => Vec::new(),
                ThinkingStyle::Folded => {
                    let content = if self.fold_open {
                        text
                    } else {
                        self.fold_open = true;
                        format!("{FOLD_OPEN}{text}")
                    };
                    vec![self.content_chunk(content)]
                }
                ThinkingStyle::Reasoning => {
                    self.reasoning.push_str(&text);
                    let delta = MessageDelta {
                        reasoning_content: Some(text),
                        ..Default::default()
                    };
                    vec![self.chunk(delta, None, None)]
                }
            },
            _ => {
                let content = if self.fold_open {
                    self.fold_open = false;
                    format!("{FOLD_CLOSE}{text}")
                } else {
                    text
                };
                vec![self.content_chunk(content)]
            }
        }
    }

    fn terminal(&mut self) -> Vec<ChatCompletionChunk> {
        self.finished = true;
        let mut out = Vec::new();
        if self.fold_open {
            out.push(self.close_fold());
        }
        if self.policy.citations == CitationStyle::Append {
            let citations = self.collect_citations();
            if !citations.is_empty() {
                let block = format_citation_block(&citations);
                self.content.push_str(&block);
                let delta = MessageDelta {
                    role: self.take_role(),
                    content: Some(block),
                    citations: Some(citations),
                    ..Default::default()
                };
                out.push(self.chunk(delta, None, None));
            }
        }
        out.push(self.chunk(
            MessageDelta::default(),
            Some(FinishReason::Stop),
            Some(placeholder_usage()),
        ));
        out
    }

    fn close_fold(&mut self) -> ChatCompletionChunk {
        self.fold_open = false;
        self.content_chunk(FOLD_CLOSE.to_string())
    }

    fn collect_citations(&self) -> Vec<Citation> {
        let mut rows: Vec<&SearchResult> = self
            .search_results
            .iter()
            .filter(|row| row.cite_index.is_some() && !row.url.is_empty())
            .collect();
        rows.sort_by_key(|row| row.cite_index);

        let mut seen = HashSet::new();
        rows.into_iter()
            .filter(|row| seen.insert(row.url.clone()))
            .map(|row| Citation {
                index: row.cite_index.unwrap_or_default(),
                title: row.title.clone(),
                url: row.url.clone(),
            })
            .collect()
    }

    fn content_chunk(&mut self, content: String) -> ChatCompletionChunk {
        self.content.push_str(&content);
        let delta = MessageDelta {
            content: Some(content),
            ..Default::default()
        };
        self.chunk(delta, None, None)
    }

    fn chunk(
        &mut self,
        mut delta: MessageDelta,
        finish_reason: Option<FinishReason>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        if delta.role.is_none() && finish_reason.is_none() {
            delta.role = self.take_role();
        }
        ChatCompletionChunk {
            id: self.stream_id(),
            model: self.model.clone(),
            object: ChunkObjectType::ChatCompletionChunk,
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
            created: self.created,
        }
    }

    fn take_role(&mut self) -> Option<Role> {
        if self.role_emitted {
            None
        } else {
            self.role_emitted = true;
            Some(Role::Assistant)
        }
    }

    fn stream_id(&self) -> String {
        format!("{}@{}", self.session_id, self.message_id)
    }
}

fn format_citation_block(citations: &[Citation]) -> String {
    let lines = citations
        .iter()
        .map(|citation| format!("{}. [{}]({})", citation.index, citation.title, citation.url))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{CITATION_HEADING}{lines}")
}

fn placeholder_usage() -> Usage {
    // The upstream exposes no token accounting.
    Usage {
        prompt_tokens: 1,
        completion_tokens: 1,
        total_tokens: 2,
    }
}

/// `[citation:N]` inline markers become `[N]`, or disappear entirely when
/// citations are suppressed.
fn rewrite_citation_markers(text: &str, keep: bool) -> String {
    const MARKER: &str = "[citation:";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(MARKER) {
        let tail = &rest[start + MARKER.len()..];
        match tail.find(']') {
            Some(end) if end > 0 && tail[..end].bytes().all(|b| b.is_ascii_digit()) => {
                out.push_str(&rest[..start]);
                if keep {
                    out.push('[');
                    out.push_str(&tail[..end]);
                    out.push(']');
                }
                rest = &tail[end + 1..];
            }
            _ => {
                out.push_str(&rest[..start + MARKER.len()]);
                rest = &rest[start + MARKER.len()..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Encodes one chunk as a downstream SSE event.
pub fn chunk_to_sse(chunk: &ChatCompletionChunk) -> Bytes {
    match serde_json::to_string(chunk) {
        Ok(json) => sse::encode_data(&json),
        Err(_) => Bytes::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat2api_protocol::event::CitePatch;

    fn transcoder(policy: OutputPolicy) -> StreamTranscoder {
        StreamTranscoder::new("chat", "sess", policy, 1_700_000_000)
    }

    fn plain() -> OutputPolicy {
        OutputPolicy {
            thinking: ThinkingStyle::Reasoning,
            citations: CitationStyle::Append,
        }
    }

    fn delta_content(chunks: &[ChatCompletionChunk]) -> String {
        chunks
            .iter()
            .flat_map(|chunk| &chunk.choices)
            .filter_map(|choice| choice.delta.content.clone())
            .collect()
    }

    #[test]
    fn sections_route_to_matching_accumulators() {
        let mut tc = transcoder(plain());
        let mut chunks = Vec::new();
        chunks.extend(tc.push(ChatEvent::Section(Section::Thinking)));
        chunks.extend(tc.push(ChatEvent::Fragment("a".to_string())));
        chunks.extend(tc.push(ChatEvent::Section(Section::Content)));
        chunks.extend(tc.push(ChatEvent::Fragment("b".to_string())));
        chunks.extend(tc.push(ChatEvent::Section(Section::Thinking)));
        chunks.extend(tc.push(ChatEvent::Fragment("c".to_string())));

        let reasoning: String = chunks
            .iter()
            .flat_map(|chunk| &chunk.choices)
            .filter_map(|choice| choice.delta.reasoning_content.clone())
            .collect();
        assert_eq!(reasoning, "ac");
        assert_eq!(delta_content(&chunks), "b");
    }

    #[test]
    fn first_emitted_delta_announces_role() {
        let mut tc = transcoder(plain());
        let first = tc.push(ChatEvent::Fragment("hi".to_string()));
        assert_eq!(first[0].choices[0].delta.role, Some(Role::Assistant));
        let second = tc.push(ChatEvent::Fragment("again".to_string()));
        assert_eq!(second[0].choices[0].delta.role, None);
    }

    #[test]
    fn folded_mode_opens_once_and_closes_before_content() {
        let mut tc = transcoder(OutputPolicy {
            thinking: ThinkingStyle::Folded,
            citations: CitationStyle::Append,
        });
        let mut chunks = Vec::new();
        chunks.extend(tc.push(ChatEvent::Section(Section::Thinking)));
        chunks.extend(tc.push(ChatEvent::Fragment("x".to_string())));
        chunks.extend(tc.push(ChatEvent::Fragment("y".to_string())));
        chunks.extend(tc.push(ChatEvent::Section(Section::Content)));
        chunks.extend(tc.push(ChatEvent::Fragment("z".to_string())));
        chunks.extend(tc.push(ChatEvent::Fragment("w".to_string())));

        let content = delta_content(&chunks);
        assert_eq!(content, format!("{FOLD_OPEN}xy{FOLD_CLOSE}zw"));
        assert_eq!(content.matches(FOLD_OPEN).count(), 1);
        assert_eq!(content.matches(FOLD_CLOSE).count(), 1);
    }

    #[test]
    fn folded_shell_left_open_is_closed_at_terminal() {
        let mut tc = transcoder(OutputPolicy {
            thinking: ThinkingStyle::Folded,
            citations: CitationStyle::Append,
        });
        tc.push(ChatEvent::Section(Section::Thinking));
        tc.push(ChatEvent::Fragment("only thinking".to_string()));
        let chunks = tc.push(ChatEvent::Done);
        assert!(delta_content(&chunks).starts_with(FOLD_CLOSE));
    }

    #[test]
    fn silent_mode_suppresses_thinking() {
        let mut tc = transcoder(OutputPolicy {
            thinking: ThinkingStyle::Silent,
            citations: CitationStyle::Append,
        });
        tc.push(ChatEvent::Section(Section::Thinking));
        assert!(tc.push(ChatEvent::Fragment("hidden".to_string())).is_empty());
        tc.push(ChatEvent::Section(Section::Content));
        let chunks = tc.push(ChatEvent::Fragment("shown".to_string()));
        assert_eq!(delta_content(&chunks), "shown");
    }

    #[test]
    fn citation_markers_rewrite_or_strip() {
        assert_eq!(
            rewrite_citation_markers("see [citation:3] there", true),
            "see [3] there"
        );
        assert_eq!(
            rewrite_citation_markers("see [citation:3] there", false),
            "see  there"
        );
        assert_eq!(
            rewrite_citation_markers("broken [citation:x]", true),
            "broken [citation:x]"
        );
    }

    #[test]
    fn citations_are_deduplicated_and_index_ordered() {
        let mut tc = transcoder(plain());
        tc.push(ChatEvent::SearchResults(vec![
            SearchResult {
                title: "A".to_string(),
                url: "http://a".to_string(),
                cite_index: Some(2),
            },
            SearchResult {
                title: "B".to_string(),
                url: "http://b".to_string(),
                cite_index: Some(1),
            },
            SearchResult {
                title: "A".to_string(),
                url: "http://a".to_string(),
                cite_index: Some(2),
            },
        ]));
        let chunks = tc.push(ChatEvent::Done);

        let citations = chunks
            .iter()
            .flat_map(|chunk| &chunk.choices)
            .find_map(|choice| choice.delta.citations.clone())
            .unwrap();
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].url, "http://b");
        assert_eq!(citations[1].url, "http://a");

        let block = delta_content(&chunks);
        assert!(block.contains("1. [B](http://b)\n2. [A](http://a)"));
    }

    #[test]
    fn batch_patches_assign_cite_indices() {
        let mut tc = transcoder(plain());
        tc.push(ChatEvent::SearchResults(vec![SearchResult {
            title: "A".to_string(),
            url: "http://a".to_string(),
            cite_index: None,
        }]));
        tc.push(ChatEvent::CiteIndexPatch(vec![
            CitePatch {
                index: 0,
                cite_index: 9,
            },
            CitePatch {
                index: 0,
                cite_index: 1,
            },
            CitePatch {
                index: 5,
                cite_index: 3,
            },
        ]));
        let chunks = tc.push(ChatEvent::Done);
        let block = delta_content(&chunks);
        assert!(block.contains("1. [A](http://a)"));
    }

    #[test]
    fn terminal_is_emitted_exactly_once() {
        let mut tc = transcoder(plain());
        tc.push(ChatEvent::Fragment("hi".to_string()));
        let first = tc.push(ChatEvent::Done);
        let stops = first
            .iter()
            .flat_map(|chunk| &chunk.choices)
            .filter(|choice| choice.finish_reason == Some(FinishReason::Stop))
            .count();
        assert_eq!(stops, 1);
        assert!(first.last().unwrap().usage.is_some());

        assert!(tc.push(ChatEvent::Done).is_empty());
        assert!(tc.finish().is_empty());
        assert!(tc.push(ChatEvent::Fragment("late".to_string())).is_empty());
    }

    #[test]
    fn transport_close_synthesizes_terminal() {
        let mut tc = transcoder(plain());
        tc.push(ChatEvent::Fragment("partial".to_string()));
        let chunks = tc.finish();
        assert_eq!(
            chunks.last().unwrap().choices[0].finish_reason,
            Some(FinishReason::Stop)
        );
    }

    #[test]
    fn interrupt_degrades_to_in_band_terminal() {
        let mut tc = transcoder(plain());
        tc.push(ChatEvent::Fragment("partial".to_string()));
        let chunks = tc.interrupt("upstream went away");
        assert!(delta_content(&chunks).contains("upstream went away"));
        assert_eq!(
            chunks.last().unwrap().choices[0].finish_reason,
            Some(FinishReason::Stop)
        );
        assert!(tc.interrupt("again").is_empty());
    }

    #[test]
    fn message_id_first_write_wins_and_names_the_stream() {
        let mut tc = transcoder(plain());
        tc.push(ChatEvent::MessageId("7".to_string()));
        tc.push(ChatEvent::MessageId("8".to_string()));
        let chunks = tc.push(ChatEvent::Fragment("x".to_string()));
        assert_eq!(chunks[0].id, "sess@7");
    }

    #[test]
    fn rpc_messages_drive_the_same_machine() {
        use chat2api_protocol::connect::parse_stream;
        let mut body = bytes::BytesMut::new();
        for payload in [
            serde_json::json!({"message": {"id": "m1", "role": "assistant"}}),
            serde_json::json!({"op": "set", "block": {"text": {"content": "he"}}}),
            serde_json::json!({"op": "append", "block": {"text": {"content": "llo"}}}),
            serde_json::json!({"done": true}),
        ] {
            body.extend_from_slice(&chat2api_protocol::connect::encode_message(&payload).unwrap());
        }

        let mut tc = transcoder(plain());
        let mut chunks = Vec::new();
        for message in parse_stream(&body) {
            chunks.extend(tc.push_rpc(&message));
        }
        assert_eq!(delta_content(&chunks), "hello");
        assert_eq!(chunks[0].id, "sess@m1");
        assert_eq!(
            chunks.last().unwrap().choices[0].finish_reason,
            Some(FinishReason::Stop)
        );
    }

    #[test]
    fn buffered_mode_exposes_only_the_final_result() {
        let mut tc = transcoder(plain());
        tc.push(ChatEvent::Section(Section::Thinking));
        tc.push(ChatEvent::Fragment("why".to_string()));
        tc.push(ChatEvent::Section(Section::Content));
        tc.push(ChatEvent::Fragment(" answer ".to_string()));
        tc.push(ChatEvent::Done);
        let completion = tc.into_completion();
        let message = &completion.choices[0].message;
        assert_eq!(message.content, "answer");
        assert_eq!(message.reasoning_content.as_deref(), Some("why"));
        assert_eq!(completion.choices[0].finish_reason, FinishReason::Stop);
    }
}
