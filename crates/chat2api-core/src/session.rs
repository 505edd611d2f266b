//! Conversation handles.

/// A live upstream conversation. Handles the core created itself are torn
/// down best-effort once the stream completes, so the caller's upstream
/// history is not polluted; caller-supplied ones are left alone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    pub parent_message_id: Option<String>,
    pub fresh: bool,
}

/// Parses a `"{session_id}@{parent_message_id}"` conversation reference.
///
/// Malformed references are treated as absent so the caller gets a fresh
/// conversation instead of an error.
pub fn parse_conversation_ref(reference: Option<&str>) -> Option<(String, String)> {
    let (session, parent) = reference?.split_once('@')?;
    let session_ok = session.len() == 36
        && session
            .chars()
            .all(|c| matches!(c, '0'..='9' | 'a'..='z' | '-'));
    let parent_ok = !parent.is_empty() && parent.chars().all(|c| c.is_ascii_digit());
    (session_ok && parent_ok).then(|| (session.to_string(), parent.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9";

    #[test]
    fn well_formed_reference_parses() {
        let reference = format!("{SESSION}@42");
        assert_eq!(
            parse_conversation_ref(Some(&reference)),
            Some((SESSION.to_string(), "42".to_string()))
        );
    }

    #[test]
    fn malformed_references_are_absent() {
        assert_eq!(parse_conversation_ref(None), None);
        assert_eq!(parse_conversation_ref(Some("")), None);
        assert_eq!(parse_conversation_ref(Some("short@1")), None);
        assert_eq!(parse_conversation_ref(Some(SESSION)), None);
        let non_numeric = format!("{SESSION}@abc");
        assert_eq!(parse_conversation_ref(Some(&non_numeric)), None);
        let uppercase = format!("{}@1", SESSION.to_uppercase());
        assert_eq!(parse_conversation_ref(Some(&uppercase)), None);
    }
}
