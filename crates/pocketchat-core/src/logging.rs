//! Optional JSONL debug logs of prompts and completions.
//!
//! Entries are appended to files in the home directory when the matching
//! [`DebugKey`] is enabled.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

pub const PROMPTS_LOG: &str = "prompts.jsonl";
pub const COMPLETIONS_LOG: &str = "completions.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugKey {
    /// Log every prompt sent to the model to prompts.jsonl
    PromptLog,
    /// Log every finished completion to completions.jsonl
    CompletionLog,
    All,
}

impl DebugKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prompt-log" | "prompt_log" => Some(DebugKey::PromptLog),
            "completion-log" | "completion_log" => Some(DebugKey::CompletionLog),
            "all" => Some(DebugKey::All),
            _ => None,
        }
    }

    /// Parse a comma-separated list (e.g. "prompt-log,completion-log").
    /// Invalid segments are silently ignored.
    pub fn parse_list(s: &str) -> Vec<Self> {
        s.split(',')
            .filter_map(|segment| Self::parse(segment.trim()))
            .collect()
    }
}

/// Append `{"timestamp": ..., data_key: data}` to `dir/filename` if `debug`
/// enables `required_key`. `DebugKey::All` always matches.
pub fn log_to_jsonl(
    dir: &Path,
    debug: &[DebugKey],
    required_key: DebugKey,
    filename: &str,
    data_key: &str,
    data: &serde_json::Value,
) {
    let should_log = debug
        .iter()
        .any(|k| matches!(k, DebugKey::All) || *k == required_key);
    if !should_log {
        return;
    }

    let log_entry = json!({
        "timestamp": chrono::Utc::now().timestamp(),
        data_key: data,
    });

    let log_path = dir.join(filename);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_path)
        && let Ok(json) = serde_json::to_string(&log_entry)
    {
        let _ = writeln!(file, "{}", json);
    }
}
