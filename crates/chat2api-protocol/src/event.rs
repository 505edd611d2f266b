//! Classification of upstream stream envelopes.
//!
//! Upstream payloads are loosely shaped JSON: a path selector `p`, a value
//! `v` that may be a string fragment or a structured list, an operation tag
//! `o`, and an occasional message-id announcement. Everything is classified
//! here into a closed set of [`ChatEvent`]s before any handling logic runs,
//! so unknown or ignorable shapes are tolerated in exactly one place.

use serde::Deserialize;
use serde_json::Value;

use crate::sse::SseEvent;

const PATH_THINKING: &str = "response/thinking_content";
const PATH_CONTENT: &str = "response/content";
const PATH_SEARCH_STATUS: &str = "response/search_status";
const PATH_SEARCH_RESULTS: &str = "response/search_results";
const OP_BATCH: &str = "BATCH";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Content,
    Thinking,
}

/// One search-result row as the upstream reports it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub cite_index: Option<i64>,
}

/// A positional citation-index assignment from a batch update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CitePatch {
    pub index: usize,
    pub cite_index: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Section(Section),
    Fragment(String),
    SearchResults(Vec<SearchResult>),
    CiteIndexPatch(Vec<CitePatch>),
    MessageId(String),
    Done,
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    p: Option<String>,
    #[serde(default)]
    v: Option<Value>,
    #[serde(default)]
    o: Option<String>,
    #[serde(default)]
    response_message_id: Option<Value>,
}

/// Classifies one SSE event into zero or more [`ChatEvent`]s.
///
/// A single envelope may announce a message id, switch the section and carry
/// a fragment at once; the returned order preserves upstream semantics.
pub fn classify(event: &SseEvent) -> Vec<ChatEvent> {
    if event.event.as_deref() == Some("close") || event.data.trim() == DONE_SENTINEL {
        return vec![ChatEvent::Done];
    }
    if event.data.is_empty() {
        return Vec::new();
    }
    let Ok(envelope) = serde_json::from_str::<Envelope>(&event.data) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    if let Some(id) = envelope.response_message_id.as_ref().and_then(id_string) {
        out.push(ChatEvent::MessageId(id));
    }

    match envelope.p.as_deref() {
        Some(PATH_THINKING) => out.push(ChatEvent::Section(Section::Thinking)),
        Some(PATH_CONTENT) => out.push(ChatEvent::Section(Section::Content)),
        Some(PATH_SEARCH_STATUS) => return out,
        Some(PATH_SEARCH_RESULTS) => {
            if let Some(Value::Array(items)) = envelope.v {
                if envelope.o.as_deref() == Some(OP_BATCH) {
                    out.push(ChatEvent::CiteIndexPatch(parse_patches(&items)));
                } else {
                    out.push(ChatEvent::SearchResults(parse_results(items)));
                }
            }
            return out;
        }
        _ => {}
    }

    if let Some(Value::String(fragment)) = envelope.v {
        out.push(ChatEvent::Fragment(fragment));
    }
    out
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_results(items: Vec<Value>) -> Vec<SearchResult> {
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

fn parse_patches(items: &[Value]) -> Vec<CitePatch> {
    let mut patches = Vec::new();
    for item in items {
        let Some(path) = item.get("p").and_then(Value::as_str) else {
            continue;
        };
        let Some(position) = path.strip_suffix("/cite_index") else {
            continue;
        };
        let Ok(index) = position.parse::<usize>() else {
            continue;
        };
        if let Some(cite_index) = item.get("v").and_then(Value::as_i64) {
            patches.push(CitePatch { index, cite_index });
        }
    }
    patches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_event(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn close_event_is_terminal() {
        let event = SseEvent {
            event: Some("close".to_string()),
            data: String::new(),
        };
        assert_eq!(classify(&event), vec![ChatEvent::Done]);
        assert_eq!(classify(&data_event("[DONE]")), vec![ChatEvent::Done]);
    }

    #[test]
    fn path_switch_with_fragment() {
        let events = classify(&data_event(
            "{\"p\":\"response/thinking_content\",\"v\":\"hm\"}",
        ));
        assert_eq!(
            events,
            vec![
                ChatEvent::Section(Section::Thinking),
                ChatEvent::Fragment("hm".to_string()),
            ]
        );
    }

    #[test]
    fn bare_fragment_has_no_section() {
        assert_eq!(
            classify(&data_event("{\"v\":\"more\"}")),
            vec![ChatEvent::Fragment("more".to_string())]
        );
    }

    #[test]
    fn search_status_is_swallowed() {
        assert!(classify(&data_event("{\"p\":\"response/search_status\",\"v\":\"x\"}")).is_empty());
    }

    #[test]
    fn search_results_replace_and_batch_patches() {
        let events = classify(&data_event(
            "{\"p\":\"response/search_results\",\"v\":[{\"title\":\"t\",\"url\":\"u\"}]}",
        ));
        assert_eq!(
            events,
            vec![ChatEvent::SearchResults(vec![SearchResult {
                title: "t".to_string(),
                url: "u".to_string(),
                cite_index: None,
            }])]
        );

        let events = classify(&data_event(
            "{\"p\":\"response/search_results\",\"o\":\"BATCH\",\
             \"v\":[{\"p\":\"0/cite_index\",\"v\":2},{\"p\":\"bad\",\"v\":1}]}",
        ));
        assert_eq!(
            events,
            vec![ChatEvent::CiteIndexPatch(vec![CitePatch {
                index: 0,
                cite_index: 2,
            }])]
        );
    }

    #[test]
    fn message_id_accepts_numbers_and_strings() {
        assert_eq!(
            classify(&data_event("{\"response_message_id\":7}")),
            vec![ChatEvent::MessageId("7".to_string())]
        );
        assert_eq!(
            classify(&data_event("{\"response_message_id\":\"m1\",\"v\":\"a\"}")),
            vec![
                ChatEvent::MessageId("m1".to_string()),
                ChatEvent::Fragment("a".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_json_is_ignored() {
        assert!(classify(&data_event("{nope")).is_empty());
    }
}
