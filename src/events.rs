//! Diagnostic event sink
//!
//! Every lifecycle transition of an application (lookup, boot, readiness,
//! kill, shutdown) is recorded here as a single rendered line of the form
//! `name key=value key=value`. The most recent lines are retained for the
//! status API and each one is also emitted through `tracing`.

use crate::linebuffer::LineBuffer;
use parking_lot::Mutex;
use tracing::info;

/// Default number of events retained
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Bounded, shared record of recent diagnostic events
pub struct Events {
    recent: Mutex<LineBuffer>,
}

impl Events {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(LineBuffer::new(capacity)),
        }
    }

    /// Record an event and return its rendered form
    pub fn add(&self, name: &str, fields: &[(&str, String)]) -> String {
        let rendered = render(name, fields);
        info!(target: "events", event = name, "{}", rendered);
        self.recent.lock().append(rendered.clone());
        rendered
    }

    /// Rendered events, oldest first
    pub fn recent(&self) -> Vec<String> {
        self.recent.lock().lines().map(str::to_string).collect()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

fn render(name: &str, fields: &[(&str, String)]) -> String {
    let mut out = String::from(name);
    for (key, value) in fields {
        out.push(' ');
        out.push_str(key);
        out.push('=');
        if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"') {
            out.push_str(&format!("{:?}", value));
        } else {
            out.push_str(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_plain_fields() {
        let events = Events::new(8);
        let line = events.add(
            "booting_app",
            &[("app", "blog".to_string()), ("port", 3042.to_string())],
        );
        assert_eq!(line, "booting_app app=blog port=3042");
    }

    #[test]
    fn test_render_quotes_whitespace() {
        let events = Events::new(8);
        let line = events.add("killing_app", &[("reason", "app is idle".to_string())]);
        assert_eq!(line, r#"killing_app reason="app is idle""#);
    }

    #[test]
    fn test_render_without_fields() {
        let events = Events::new(8);
        assert_eq!(events.add("apps_purged", &[]), "apps_purged");
    }

    #[test]
    fn test_recent_is_bounded() {
        let events = Events::new(2);
        events.add("a", &[]);
        events.add("b", &[]);
        events.add("c", &[]);
        assert_eq!(events.recent(), vec!["b".to_string(), "c".to_string()]);
    }
}
