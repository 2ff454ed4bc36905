use std::fmt;

use regex::Regex;
use tracing::Subscriber;
use tracing_subscriber::Layer;

/// Scrubs API keys, bearer tokens, and password-shaped fields out of
/// log messages before they reach a sink. Applied at the formatter
/// level via [`SecretScrubbingLayer::scrub_message`] rather than as a
/// full `Layer` implementation, since intercepting every event's
/// visitor fields would mean reimplementing the formatter.
#[derive(Clone)]
pub struct SecretScrubbingLayer {
    api_key_pattern: Regex,
    token_pattern: Regex,
    bearer_pattern: Regex,
    password_pattern: Regex,
}

impl SecretScrubbingLayer {
    pub fn new() -> Self {
        Self {
            api_key_pattern: Regex::new(r"sk-ant-[a-zA-Z0-9-_]{20,}").expect("static regex"),
            token_pattern: Regex::new(
                r#"["']?(?:api_key|apikey|token|secret)["']?\s*[:=]\s*["']?([a-zA-Z0-9-_\.]{20,})["']?"#,
            )
            .expect("static regex"),
            bearer_pattern: Regex::new(r"Bearer\s+[a-zA-Z0-9-_\.]+").expect("static regex"),
            password_pattern: Regex::new(r#"["']?password["']?\s*[:=]\s*["']?([^"'\s,}]+)["']?"#)
                .expect("static regex"),
        }
    }

    pub fn scrub_message(&self, message: &str) -> String {
        let mut scrubbed = self
            .api_key_pattern
            .replace_all(message, "[API_KEY_REDACTED]")
            .to_string();
        scrubbed = self
            .bearer_pattern
            .replace_all(&scrubbed, "Bearer [TOKEN_REDACTED]")
            .to_string();
        scrubbed = self
            .token_pattern
            .replace_all(&scrubbed, |caps: &regex::Captures<'_>| {
                let full_match = &caps[0];
                if let Some(colon_pos) = full_match.find(':') {
                    format!("{}:[REDACTED]", &full_match[..colon_pos])
                } else if let Some(eq_pos) = full_match.find('=') {
                    format!("{}=[REDACTED]", &full_match[..eq_pos])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        self.password_pattern
            .replace_all(&scrubbed, "password=[REDACTED]")
            .to_string()
    }
}

impl Default for SecretScrubbingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SecretScrubbingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretScrubbingLayer").finish()
    }
}

impl<S: Subscriber> Layer<S> for SecretScrubbingLayer {}
