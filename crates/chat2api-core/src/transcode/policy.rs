/// How "thinking" text reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingStyle {
    /// Emitted as a distinct `reasoning_content` field alongside content.
    Reasoning,
    /// Wrapped in a collapsible markup shell inside content.
    Folded,
    /// Suppressed entirely.
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CitationStyle {
    /// Inline markers become `[N]`; a reference block trails the content.
    Append,
    /// Inline markers stripped; no reference block.
    Suppress,
}

/// Presentation policy for one stream. One upstream serves several caller
/// presentation variants; callers pick theirs through model-name suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPolicy {
    pub thinking: ThinkingStyle,
    pub citations: CitationStyle,
}

impl OutputPolicy {
    pub fn from_model(model: &str) -> Self {
        let thinking_model = model.contains("think") || model.contains("r1");
        let silent = model.contains("silent");
        let folded = (model.contains("fold") || model.contains("search")) && !thinking_model;
        let thinking = if silent {
            ThinkingStyle::Silent
        } else if folded {
            ThinkingStyle::Folded
        } else {
            ThinkingStyle::Reasoning
        };
        let citations = if model.contains("search-silent") {
            CitationStyle::Suppress
        } else {
            CitationStyle::Append
        };
        Self { thinking, citations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_suffixes_select_policy() {
        let plain = OutputPolicy::from_model("chat-think");
        assert_eq!(plain.thinking, ThinkingStyle::Reasoning);
        assert_eq!(plain.citations, CitationStyle::Append);

        let folded = OutputPolicy::from_model("chat-search");
        assert_eq!(folded.thinking, ThinkingStyle::Folded);
        assert_eq!(folded.citations, CitationStyle::Append);

        let silent = OutputPolicy::from_model("chat-think-silent");
        assert_eq!(silent.thinking, ThinkingStyle::Silent);

        let search_silent = OutputPolicy::from_model("chat-search-silent");
        assert_eq!(search_silent.thinking, ThinkingStyle::Silent);
        assert_eq!(search_silent.citations, CitationStyle::Suppress);
    }

    #[test]
    fn thinking_models_do_not_fold() {
        let policy = OutputPolicy::from_model("chat-r1-search");
        assert_eq!(policy.thinking, ThinkingStyle::Reasoning);
    }
}
