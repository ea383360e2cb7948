//! CLI argument parsing with clap.

use clap::Parser;
use pocketchat_core::{Config, DebugKey, PromptStyle};
use std::path::PathBuf;
use std::str::FromStr;

const CLI_AFTER_HELP: &str = "\
Type a message and press enter to chat. Commands:
  /model <path>   load a GGUF model
  /bench          benchmark the model
  /release        release the context
  /stop           stop the current completion (or press Ctrl-C)
  /reset          start a new conversation
  /save-session   save the session to disk
  /load-session   restore the saved session
  /quit           exit

Configuration is read from <home>/config.toml.";

fn parse_style(s: &str) -> Result<PromptStyle, String> {
    PromptStyle::from_str(s).map_err(|_| format!("unknown prompt style '{}' (chat, instruct)", s))
}

#[derive(Parser, Debug)]
#[command(
    name = "pocketchat",
    version,
    about = "Chat with a local GGUF model through llama-server",
    after_help = CLI_AFTER_HELP
)]
pub struct Cli {
    /// Model to load on startup
    #[arg(short = 'm', long, value_name = "PATH")]
    pub model: Option<PathBuf>,

    /// Prompt style: chat or instruct
    #[arg(short = 's', long, value_name = "STYLE", value_parser = parse_style)]
    pub style: Option<PromptStyle>,

    /// Home directory (default: $POCKETCHAT_HOME or ~/.pocketchat)
    #[arg(long, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Use an already running llama-server instead of spawning one
    #[arg(long, value_name = "URL")]
    pub server_url: Option<String>,

    /// Debug logs: prompt-log, completion-log, all (comma-separated)
    #[arg(long, value_name = "KEYS")]
    pub debug: Option<String>,

    /// Show debug logging on stderr
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(style) = self.style {
            config.prompt_style = style;
        }
        if let Some(url) = &self.server_url {
            config.server.url = Some(url.clone());
        }
    }

    pub fn debug_keys(&self) -> Vec<DebugKey> {
        self.debug
            .as_deref()
            .map(DebugKey::parse_list)
            .unwrap_or_default()
    }
}
