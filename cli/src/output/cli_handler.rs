//! CLI output handler implementation

use colored::Colorize;
use grove_core::FrontendPayload;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// How many objects of a result are shown before eliding the rest
const MAX_OBJECTS_SHOWN: usize = 5;

/// Prints payloads as they arrive, with a spinner for status updates
pub struct CliOutputHandler {
    spinner: Option<ProgressBar>,
    results: usize,
}

impl Default for CliOutputHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CliOutputHandler {
    pub fn new() -> Self {
        Self {
            spinner: None,
            results: 0,
        }
    }

    fn spinner(&mut self) -> &ProgressBar {
        self.spinner.get_or_insert_with(|| {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        })
    }

    /// Print a line without tearing the spinner
    fn println(&self, line: String) {
        match &self.spinner {
            Some(spinner) => spinner.suspend(|| println!("{}", line)),
            None => println!("{}", line),
        }
    }

    pub fn handle(&mut self, payload: &FrontendPayload) {
        debug!("Payload {} ({})", payload.payload_type, payload.id);

        match payload.payload_type.as_str() {
            "status" => {
                let text = payload.text().unwrap_or_default().to_string();
                self.spinner().set_message(text);
            }
            "text" => {
                if let Some(line) = format_text(&payload.payload) {
                    self.println(line);
                }
            }
            "result" => {
                self.results += 1;
                self.println(format_result(&payload.payload));
            }
            "tree_update" => {
                self.println(format_tree_update(&payload.payload));
            }
            "warning" => {
                let text = payload.text().unwrap_or_default();
                self.println(format!("{} {}", "warning:".yellow().bold(), text));
            }
            "completed" => self.finish(),
            _ if payload.is_error() => {
                let text = payload.text().unwrap_or("unknown error");
                self.println(format!("{} {}", "error:".red().bold(), text));
            }
            other => debug!("Ignoring payload type {}", other),
        }
    }

    /// Clear the spinner
    pub fn finish(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }

    pub fn results_shown(&self) -> usize {
        self.results
    }
}

fn objects(payload: &Value) -> &[Value] {
    payload
        .get("objects")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Responses and summaries; summaries get their title in bold
pub fn format_text(payload: &Value) -> Option<String> {
    let mut lines = Vec::new();
    for object in objects(payload) {
        if let Some(title) = object.get("title").and_then(Value::as_str) {
            if !title.is_empty() {
                lines.push(title.bold().to_string());
            }
        }
        if let Some(text) = object.get("text").and_then(Value::as_str) {
            lines.push(text.to_string());
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

pub fn format_result(payload: &Value) -> String {
    let kind = payload.get("type").and_then(Value::as_str).unwrap_or("result");
    let items = objects(payload);
    let mut out = format!(
        "{} {} ({} object{})",
        "▸".green(),
        kind.green().bold(),
        items.len(),
        if items.len() == 1 { "" } else { "s" }
    );

    for item in items.iter().take(MAX_OBJECTS_SHOWN) {
        let line = serde_json::to_string(item).unwrap_or_default();
        out.push_str(&format!("\n  {}", line.dimmed()));
    }
    if items.len() > MAX_OBJECTS_SHOWN {
        out.push_str(&format!("\n  … {} more", items.len() - MAX_OBJECTS_SHOWN));
    }
    out
}

pub fn format_tree_update(payload: &Value) -> String {
    let field = |key: &str| payload.get(key).and_then(Value::as_str).unwrap_or_default();
    let mut out = format!("{} {} → {}", "◆".blue(), field("node"), field("decision").bold());
    let reasoning = field("reasoning");
    if !reasoning.is_empty() {
        out.push_str(&format!("\n  {}", reasoning.dimmed()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_text_joins_objects() {
        colored::control::set_override(false);
        let payload = json!({
            "type": "summary",
            "objects": [{"title": "Weekly report", "text": "All good."}]
        });
        assert_eq!(format_text(&payload).unwrap(), "Weekly report\nAll good.");
        assert!(format_text(&json!({"objects": []})).is_none());
    }

    #[test]
    fn test_format_result_elides_long_results() {
        colored::control::set_override(false);
        let rows: Vec<Value> = (0..7).map(|i| json!({"n": i})).collect();
        let out = format_result(&json!({"type": "table", "objects": rows}));

        assert!(out.starts_with("▸ table (7 objects)"));
        assert!(out.contains("{\"n\":4}"));
        assert!(!out.contains("{\"n\":5}"));
        assert!(out.ends_with("… 2 more"));
    }

    #[test]
    fn test_format_tree_update() {
        colored::control::set_override(false);
        let out = format_tree_update(&json!({
            "node": "base",
            "decision": "search",
            "reasoning": "Needs data",
            "reset": false
        }));
        assert_eq!(out, "◆ base → search\n  Needs data");
    }

    #[test]
    fn test_handle_counts_results() {
        let mut handler = CliOutputHandler::new();
        let payload = FrontendPayload {
            payload_type: "result".to_string(),
            user_id: "u".to_string(),
            conversation_id: "c".to_string(),
            query_id: "q".to_string(),
            id: "res-1".to_string(),
            payload: json!({"type": "generic", "objects": [{"a": 1}]}),
        };
        handler.handle(&payload);
        handler.finish();
        assert_eq!(handler.results_shown(), 1);
    }
}
