use crate::error::{CoreResult, RelayError};
use crate::model::{ChatMessage, ChatRequest, OptimizeRequest, DEFAULT_SYSTEM_PROMPT};
use unicode_normalization::UnicodeNormalization;

pub const PROMPT_REQUIRED: &str = "Prompt is required";

pub fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') { // Byte Order Mark
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Reject requests whose prompt is empty after trimming.
pub fn validate_optimize(req: &OptimizeRequest) -> CoreResult<()> {
    if req.prompt.trim().is_empty() {
        return Err(RelayError::Validation(PROMPT_REQUIRED.to_string()));
    }
    Ok(())
}

/// Build the two-message exchange sent upstream.
///
/// A blank or absent system prompt falls back to [`DEFAULT_SYSTEM_PROMPT`].
/// `purpose` is not read here; clients fold it into the prompt before
/// sending.
pub fn build_chat_request(req: &OptimizeRequest, model: &str) -> CoreResult<ChatRequest> {
    validate_optimize(req)?;
    let prompt = clean_text(&req.prompt);
    if prompt.is_empty() {
        // whitespace-only after NFC, e.g. a lone BOM
        return Err(RelayError::Validation(PROMPT_REQUIRED.to_string()));
    }
    let system = req
        .system_prompt
        .as_deref()
        .map(clean_text)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    Ok(ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::system(system), ChatMessage::user(prompt)],
    })
}
