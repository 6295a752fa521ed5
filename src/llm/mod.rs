pub mod tensorzero;

pub use tensorzero::{LlmClient, LlmConfig, LlmError, LlmMessage};

/// Models often wrap JSON answers in a ```json fence.
pub fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}
