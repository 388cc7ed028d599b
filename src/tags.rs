//! Out-of-band segments embedded in stored and streamed text.
//!
//! Every parser honours only the first well-formed occurrence of its tag and
//! returns `(block, remaining)`. When the tag is absent the input is returned
//! untouched; when it is found the remaining text is trimmed.

use crate::store::Role;

const THINK_OPEN: &str = "<think time=";
const THINK_CLOSE: &str = "</think>";
const SEARCH_OPEN: &str = "<search>";
const SEARCH_CLOSE: &str = "</search>";
const MODEL_OPEN: &str = "<model=\"";
const MODEL_CLOSE: &str = "\"/>";
const BASE64_OPEN: &str = "<base64>";
const BASE64_CLOSE: &str = "</base64>";
const IMAGE_OPEN: &str = "<image>";
const IMAGE_CLOSE: &str = "</image>";

/// Byte offsets of one located block: `text[start..end]` is the whole block,
/// `text[inner_start..inner_end]` its payload.
struct Span {
    start: usize,
    inner_start: usize,
    inner_end: usize,
    end: usize,
}

fn find_span(text: &str, open: &str, close: &str) -> Option<Span> {
    let start = text.find(open)?;
    let inner_start = start + open.len();
    let inner_end = inner_start + text[inner_start..].find(close)?;
    Some(Span {
        start,
        inner_start,
        inner_end,
        end: inner_end + close.len(),
    })
}

fn without(text: &str, span: &Span) -> String {
    let mut out = String::with_capacity(text.len() - (span.end - span.start));
    out.push_str(&text[..span.start]);
    out.push_str(&text[span.end..]);
    out.trim().to_string()
}

/// Locate `<think time=N>…</think>`, skipping openers without a numeric time.
fn find_think(text: &str) -> Option<(Span, &str)> {
    let mut from = 0;
    while let Some(rel) = text[from..].find(THINK_OPEN) {
        let start = from + rel;
        let digits_start = start + THINK_OPEN.len();
        let digits_len = text[digits_start..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        let gt = digits_start + digits_len;
        if digits_len > 0 && text[gt..].starts_with('>') {
            let inner_start = gt + 1;
            let inner_end = inner_start + text[inner_start..].find(THINK_CLOSE)?;
            let span = Span {
                start,
                inner_start,
                inner_end,
                end: inner_end + THINK_CLOSE.len(),
            };
            return Some((span, &text[digits_start..gt]));
        }
        from = digits_start;
    }
    None
}

/// Extract the reasoning block, normalized to `<think time=N>content</think>`
/// with the content trimmed.
pub fn parse_think(text: &str) -> (Option<String>, String) {
    if text.is_empty() {
        return (None, String::new());
    }
    match find_think(text) {
        Some((span, time)) => {
            let content = text[span.inner_start..span.inner_end].trim();
            let block = format!("{THINK_OPEN}{time}>{content}{THINK_CLOSE}");
            (Some(block), without(text, &span))
        }
        None => (None, text.to_string()),
    }
}

/// Extract the `<search>…</search>` block (kept whole, payload trimmed).
pub fn parse_search(text: &str) -> (Option<String>, String) {
    if text.is_empty() {
        return (None, String::new());
    }
    match find_span(text, SEARCH_OPEN, SEARCH_CLOSE) {
        Some(span) => {
            let payload = text[span.inner_start..span.inner_end].trim();
            (Some(search_block(payload)), without(text, &span))
        }
        None => (None, text.to_string()),
    }
}

/// Extract the provenance tag `<model="NAME"/>`, returning NAME.
pub fn parse_model(text: &str) -> (Option<String>, String) {
    payload_of(text, MODEL_OPEN, MODEL_CLOSE)
}

/// Extract the raw attachment payload of `<base64>…</base64>`.
pub fn parse_base64(text: &str) -> (Option<String>, String) {
    payload_of(text, BASE64_OPEN, BASE64_CLOSE)
}

/// Extract the image description of `<image>…</image>`.
pub fn parse_image(text: &str) -> (Option<String>, String) {
    payload_of(text, IMAGE_OPEN, IMAGE_CLOSE)
}

fn payload_of(text: &str, open: &str, close: &str) -> (Option<String>, String) {
    if text.is_empty() {
        return (None, String::new());
    }
    match find_span(text, open, close) {
        Some(span) => {
            let payload = text[span.inner_start..span.inner_end].to_string();
            (Some(payload), without(text, &span))
        }
        None => (None, text.to_string()),
    }
}

/// Seconds recorded in a `<think time=N>` block.
pub fn think_time(block: &str) -> Option<u64> {
    find_think(block).and_then(|(_, time)| time.parse().ok())
}

pub fn think_block(secs: u64, reasoning: &str) -> String {
    format!("{THINK_OPEN}{secs}>{reasoning}{THINK_CLOSE}")
}

pub fn search_block(payload: &str) -> String {
    format!("{SEARCH_OPEN}{payload}{SEARCH_CLOSE}")
}

pub fn model_tag(name: &str) -> String {
    format!("{MODEL_OPEN}{name}{MODEL_CLOSE}")
}

pub fn base64_block(payload: &str) -> String {
    format!("{BASE64_OPEN}{payload}{BASE64_CLOSE}")
}

pub fn image_block(description: &str) -> String {
    format!("{IMAGE_OPEN}{description}{IMAGE_CLOSE}")
}

/// A stored user turn as it is replayed to a provider: the raw attachment
/// is dropped, the image description stays as context.
pub fn strip_user(content: &str) -> String {
    parse_base64(content).1
}

/// A stored assistant turn as it is replayed to a provider: provenance,
/// search results and reasoning are dropped.
pub fn strip_assistant(content: &str) -> String {
    let (_, rest) = parse_model(content);
    let (_, rest) = parse_search(&rest);
    parse_think(&rest).1
}

/// Replay form of a stored turn; system and tool turns pass through.
pub fn strip_for_replay(role: Role, content: &str) -> String {
    match role {
        Role::User => strip_user(content),
        Role::Assistant => strip_assistant(content),
        Role::System | Role::Tool => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_requires_numeric_time() {
        let text = "<think time=abc>no</think> <think time=3>yes</think>tail";
        let (block, rest) = parse_think(text);
        assert_eq!(block.as_deref(), Some("<think time=3>yes</think>"));
        assert_eq!(rest, "<think time=abc>no</think> tail");
    }

    #[test]
    fn unterminated_block_is_ignored() {
        let text = "<search>[{\"href\":\"a\"}] and more";
        assert_eq!(parse_search(text), (None, text.to_string()));
    }

    #[test]
    fn think_time_reads_seconds() {
        assert_eq!(think_time("<think time=42>x</think>"), Some(42));
        assert_eq!(think_time("plain"), None);
    }

    #[test]
    fn only_first_occurrence_is_taken() {
        let (block, rest) = parse_image("<image>a</image> mid <image>b</image>");
        assert_eq!(block.as_deref(), Some("a"));
        assert_eq!(rest, "mid <image>b</image>");
    }
}
