//! Inbound message flattening.
//!
//! The completion endpoint accepts a single prompt string, so multi-turn
//! chat histories are merged into one: multipart content is reduced to its
//! text items, adjacent same-role messages collapse into one block, and
//! assistant turns are wrapped in the role-tag markers the upstream was
//! trained with.

use serde::Deserialize;

const ASSISTANT_OPEN: &str = "<｜Assistant｜>";
const ASSISTANT_CLOSE: &str = "<｜end of sentence｜>";
const USER_OPEN: &str = "<｜User｜>";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

pub fn prepare(messages: &[ChatMessage]) -> String {
    let mut blocks: Vec<(String, String)> = Vec::new();
    for message in messages {
        let text = flatten_content(&message.content);
        match blocks.last_mut() {
            Some((role, block)) if *role == message.role => {
                block.push_str("\n\n");
                block.push_str(&text);
            }
            _ => blocks.push((message.role.clone(), text)),
        }
    }

    let rendered = blocks
        .iter()
        .enumerate()
        .map(|(index, (role, text))| match role.as_str() {
            "assistant" => format!("{ASSISTANT_OPEN}{text}{ASSISTANT_CLOSE}"),
            "user" | "system" if index > 0 => format!("{USER_OPEN}{text}"),
            _ => text.clone(),
        })
        .collect::<String>();

    strip_image_markdown(&rendered)
}

fn flatten_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter(|part| part.kind == "text")
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Drops `![alt](url)` image markdown; the upstream prompt is text-only.
fn strip_image_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("![") {
        let tail = &rest[start..];
        let stripped = tail
            .find("](")
            .and_then(|mid| tail[mid..].find(')').map(|end| mid + end + 1))
            .filter(|&end| !tail[2..end].contains('\n'));
        match stripped {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &rest[start + end..];
            }
            None => {
                out.push_str(&rest[..start + 2]);
                rest = &rest[start + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(role: &str, text: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: MessageContent::Text(text.to_string()),
        }
    }

    #[test]
    fn single_user_message_passes_through() {
        assert_eq!(prepare(&[text_message("user", "hello")]), "hello");
    }

    #[test]
    fn roles_are_tagged() {
        let prompt = prepare(&[
            text_message("system", "be brief"),
            text_message("user", "hi"),
            text_message("assistant", "hey"),
            text_message("user", "follow-up"),
        ]);
        assert_eq!(
            prompt,
            "be brief<｜User｜>hi<｜Assistant｜>hey<｜end of sentence｜><｜User｜>follow-up"
        );
    }

    #[test]
    fn adjacent_same_role_messages_merge() {
        let prompt = prepare(&[
            text_message("user", "part one"),
            text_message("user", "part two"),
        ]);
        assert_eq!(prompt, "part one\n\npart two");
    }

    #[test]
    fn multipart_content_keeps_text_items() {
        let message = ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart {
                    kind: "text".to_string(),
                    text: Some("a".to_string()),
                },
                ContentPart {
                    kind: "image_url".to_string(),
                    text: None,
                },
                ContentPart {
                    kind: "text".to_string(),
                    text: Some("b".to_string()),
                },
            ]),
        };
        assert_eq!(prepare(&[message]), "a\nb");
    }

    #[test]
    fn image_markdown_is_stripped() {
        assert_eq!(
            prepare(&[text_message("user", "see ![img](http://x/y.png) here")]),
            "see  here"
        );
        assert_eq!(prepare(&[text_message("user", "lonely ![ bracket")]), "lonely ![ bracket");
    }
}
