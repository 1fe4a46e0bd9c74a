//! Prompt assembly and model-output parsing.

use serde_json::Value;

use crate::{CallContext, CallScore, ReplyRequest};

/// System instruction for the simulated prospect.
pub fn prospect_system(persona: &str, offer: &str) -> String {
    format!(
        "You are role-playing a prospect on a mock sales call.\n\n\
         Who you are:\n{persona}\n\n\
         What the caller is selling:\n{offer}\n\n\
         Stay in character. Be skeptical and busy: question vague claims, \
         push back on price and fit, and only warm up when the caller earns it. \
         Answer in one to three short spoken sentences. Never describe actions \
         or narrate; just say your line."
    )
}

/// Conversation body for the next prospect line.
///
/// `history` is expected to already end with the caller's latest line; it is
/// only appended when missing.
pub fn prospect_turn(request: &ReplyRequest) -> String {
    let mut body = request.history.trim_end().to_string();
    let latest = format!("User: {}", request.user_text.trim());
    if !body.ends_with(&latest) {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&latest);
    }
    body.push_str("\nAgent:");
    body
}

pub fn score_prompt(call: &CallContext) -> String {
    format!(
        "You coach salespeople. Review this mock sales call.\n\n\
         Prospect persona:\n{}\n\nOffer:\n{}\n\nTranscript:\n{}\n\n\
         Respond with a JSON object only, no code fences, shaped as \
         {{\"score\": <integer 0-100>, \"feedback\": \"<bullet list>\"}}. \
         The feedback is a short list of concrete, actionable bullets starting \
         with \"- \"; no summary or praise.",
        call.persona, call.offer, call.history
    )
}

pub fn title_prompt(call: &CallContext) -> String {
    format!(
        "Write a title of three to eight words for this mock sales call, \
         suitable for a dashboard list. Reply with the title only.\n\n\
         Prospect persona:\n{}\n\nOffer:\n{}\n\nTranscript:\n{}",
        call.persona, call.offer, call.history
    )
}

/// Interpret the coach model's output.
///
/// Accepts a bare or fenced JSON object; anything else becomes free-text
/// feedback with no score.
pub fn parse_score(raw: &str) -> CallScore {
    let text = raw.trim();
    let json_slice = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    };

    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(json_slice) else {
        return CallScore {
            score: None,
            feedback: text.to_string(),
        };
    };

    let score = match obj.get("score") {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };

    let feedback = match obj.get("feedback") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| {
                let s = s.trim();
                if s.starts_with('-') {
                    s.to_string()
                } else {
                    format!("- {s}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };

    CallScore { score, feedback }
}

/// Strip quotes and trailing punctuation a model likes to wrap titles in.
pub fn clean_title(raw: &str) -> String {
    raw.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .trim_matches(|c| c == '"' || c == '*' || c == '#')
        .trim()
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(history: &str, user_text: &str) -> ReplyRequest {
        ReplyRequest {
            user_text: user_text.into(),
            history: history.into(),
            persona: "VP Ops".into(),
            offer: "Fleet telematics".into(),
        }
    }

    #[test]
    fn test_prospect_turn_does_not_duplicate_latest_line() {
        let body = prospect_turn(&request("User: Hi there", "Hi there"));
        assert_eq!(body, "User: Hi there\nAgent:");
    }

    #[test]
    fn test_prospect_turn_appends_missing_latest_line() {
        let body = prospect_turn(&request("", "Got a minute?"));
        assert_eq!(body, "User: Got a minute?\nAgent:");
    }

    #[test]
    fn test_system_mentions_persona_and_offer() {
        let system = prospect_system("VP Ops", "Fleet telematics");
        assert!(system.contains("VP Ops"));
        assert!(system.contains("Fleet telematics"));
    }

    #[test]
    fn test_parse_score_plain_json() {
        let s = parse_score(r#"{"score": 81, "feedback": "- Quantify savings."}"#);
        assert_eq!(s.score, Some(81));
        assert_eq!(s.feedback, "- Quantify savings.");
    }

    #[test]
    fn test_parse_score_fenced_json_with_list() {
        let raw = "```json\n{\"score\": \"64\", \"feedback\": [\"Ask open questions\", \"- Handle price\"]}\n```";
        let s = parse_score(raw);
        assert_eq!(s.score, Some(64));
        assert_eq!(s.feedback, "- Ask open questions\n- Handle price");
    }

    #[test]
    fn test_parse_score_free_text_fallback() {
        let s = parse_score("- Slow down.\n- Listen more.");
        assert_eq!(s.score, None);
        assert_eq!(s.feedback, "- Slow down.\n- Listen more.");
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("\"Cracking the Skeptical CFO.\"\n"), "Cracking the Skeptical CFO");
        assert_eq!(clean_title("\n**Fleet Pitch Warmup**"), "Fleet Pitch Warmup");
    }
}
