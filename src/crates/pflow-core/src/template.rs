//! Jinja prompt templates and chat prompt parsing
//!
//! Templates render with trailing newlines kept and block tags trimmed, so a prompt
//! file like
//!
//! ```text
//! # system:
//! You are a helpful assistant.
//! {% for item in history %}
//! # user:
//! {{ item.question }}
//! {% endfor %}
//! ```
//!
//! renders into text that [`parse_chat`] splits into role-tagged messages.

use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_keep_trailing_newline(true);
    env
}

/// Check that a template compiles
pub fn validate_template(template: &str) -> Result<(), minijinja::Error> {
    let env = environment();
    env.template_from_str(template).map(|_| ())
}

/// Render a template with the given variables
pub fn render_template(
    template: &str,
    variables: &Map<String, Value>,
) -> Result<String, minijinja::Error> {
    let env = environment();
    env.render_str(template, minijinja::Value::from_serialize(variables))
}

/// One message of a chat prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

const ROLES: [&str; 4] = ["system", "user", "assistant", "function"];

fn role_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim();
    let trimmed = trimmed.strip_prefix('#').unwrap_or(trimmed).trim_start();
    let name = trimmed.strip_suffix(':')?.trim_end();
    ROLES
        .iter()
        .find(|role| role.eq_ignore_ascii_case(name))
        .copied()
}

fn flush(role: &str, content: &mut Vec<&str>, messages: &mut Vec<ChatMessage>) {
    let text = content.join("\n").trim().to_string();
    if !text.is_empty() {
        messages.push(ChatMessage::new(role, text));
    }
    content.clear();
}

/// Split a rendered chat prompt on `# role:` marker lines
///
/// Text before the first marker becomes a user message. Empty messages are
/// dropped.
pub fn parse_chat(prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut role = "user";
    let mut content: Vec<&str> = Vec::new();

    for line in prompt.lines() {
        match role_marker(line) {
            Some(next) => {
                flush(role, &mut content, &mut messages);
                role = next;
            }
            None => content.push(line),
        }
    }
    flush(role, &mut content, &mut messages);
    messages
}
