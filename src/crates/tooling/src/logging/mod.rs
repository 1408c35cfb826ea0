//! Formatting helpers for log fields

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

/// Await `future` and log how long it took under `name`
pub async fn timed<F, T>(name: &str, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = future.await;
    debug!(operation = name, elapsed = %format_duration(start.elapsed()), "completed");
    result
}

/// Human-readable duration
///
/// ```rust
/// use std::time::Duration;
/// use tooling::logging::format_duration;
///
/// assert_eq!(format_duration(Duration::from_micros(250)), "250μs");
/// assert_eq!(format_duration(Duration::from_millis(42)), "42ms");
/// assert_eq!(format_duration(Duration::from_millis(2500)), "2.50s");
/// assert_eq!(format_duration(Duration::from_secs(601)), "10m1s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();
    match micros {
        0..=999 => format!("{}μs", micros),
        1_000..=999_999 => format!("{}ms", micros / 1_000),
        1_000_000..=59_999_999 => format!("{:.2}s", duration.as_secs_f64()),
        _ => {
            let seconds = duration.as_secs();
            format!("{}m{}s", seconds / 60, seconds % 60)
        }
    }
}

fn secret_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?i)(bearer)\s+[A-Za-z0-9._~+/=-]+", "$1 [REDACTED]"),
            (
                r#"(?i)("?(?:api[_-]?key|password|secret|token)"?\s*[:=]\s*)("[^"]*"|[^\s,}]+)"#,
                "$1[REDACTED]",
            ),
            (r"\bsk-[A-Za-z0-9_-]{8,}", "[REDACTED]"),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Some((Regex::new(pattern).ok()?, replacement)))
        .collect()
    })
}

/// Mask credentials before a request or response body reaches a log line
///
/// ```rust
/// use tooling::logging::sanitize_for_logging;
///
/// let line = r#"{"api_key": "abc123", "model": "gpt-4"}"#;
/// let clean = sanitize_for_logging(line);
/// assert!(!clean.contains("abc123"));
/// assert!(clean.contains("gpt-4"));
/// ```
pub fn sanitize_for_logging(input: &str) -> String {
    secret_patterns()
        .iter()
        .fold(input.to_string(), |text, (pattern, replacement)| {
            pattern.replace_all(&text, *replacement).into_owned()
        })
}

/// Cut `text` to at most `max_chars` characters, marking the cut
pub fn truncate_for_logging(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}... ({} chars)", &text[..end], text.chars().count()),
        None => text.to_string(),
    }
}
