//! Configuration loaded from `<home>/config.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.

use crate::backend::CompletionParams;
use crate::prompt::PromptStyle;
use dirs_next::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

/// Browser user agent sent with quote requests. The quote endpoint rejects
/// requests without one.
pub const DEFAULT_USER_AGENT: &str = "YMozilla/5.0 (Macintosh; Intel Mac OS X 10_10_1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/39.0.2171.95 Safari/537.36";

pub const DEFAULT_QUOTE_BASE_URL: &str = "https://query1.finance.yahoo.com";

/// For each field name, if `$src.field` is `Some(v)`, sets `$dst.field = v`.
macro_rules! apply_option_overrides {
    ($src:expr, $dst:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(ref v) = $src.$field {
                $dst.$field = v.clone();
            }
        )+
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub prompt_style: PromptStyle,
    /// Scrape and run function calls. Unset means the prompt style decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_calls: Option<bool>,
    /// Follow-up completions allowed after function results, per message.
    #[serde(default = "default_max_function_rounds")]
    pub max_function_rounds: usize,
    /// Copy picked models into `models_dir` before loading them.
    #[serde(default)]
    pub stage_models: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub sampling: SamplingOverrides,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub quotes: QuotesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prompt_style: PromptStyle::default(),
            function_calls: None,
            max_function_rounds: default_max_function_rounds(),
            stage_models: false,
            models_dir: None,
            session_file: None,
            context: ContextConfig::default(),
            sampling: SamplingOverrides::default(),
            server: ServerConfig::default(),
            quotes: QuotesConfig::default(),
        }
    }
}

impl Config {
    pub fn function_calls_enabled(&self) -> bool {
        self.function_calls
            .unwrap_or_else(|| self.prompt_style.function_calls_by_default())
    }

    pub fn models_dir(&self, home: &Path) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| home.join("models"))
    }

    pub fn session_file(&self, home: &Path) -> PathBuf {
        self.session_file
            .clone()
            .unwrap_or_else(|| home.join("llama-session.bin"))
    }

    /// Sampling preset for the current prompt style with overrides applied.
    pub fn completion_params(&self) -> CompletionParams {
        self.sampling.merge(self.prompt_style.sampling())
    }
}

/// Model loading options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub n_gpu_layers: u32,
    #[serde(default = "default_use_mlock")]
    pub use_mlock: bool,
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mlock: default_use_mlock(),
            n_ctx: default_n_ctx(),
        }
    }
}

/// Per-field overrides for the prompt style's sampling preset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_predict: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl SamplingOverrides {
    /// Apply set fields on top of `base`.
    pub fn merge(&self, base: CompletionParams) -> CompletionParams {
        let mut params = base;
        apply_option_overrides!(
            self,
            params,
            n_predict,
            temperature,
            top_k,
            top_p,
            min_p,
            repeat_penalty,
            stop,
        );
        params
    }
}

/// How to reach `llama-server`.
///
/// With `url` set, an already running server is used and nothing is spawned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_binary")]
    pub binary: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
    /// Directory the server saves and restores sessions in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_save_path: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: default_server_binary(),
            url: None,
            host: default_server_host(),
            port: default_server_port(),
            startup_timeout_seconds: default_startup_timeout_seconds(),
            slot_save_path: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotesConfig {
    #[serde(default = "default_quote_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for QuotesConfig {
    fn default() -> Self {
        Self {
            base_url: default_quote_base_url(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_max_function_rounds() -> usize {
    1
}
fn default_use_mlock() -> bool {
    true
}
fn default_n_ctx() -> u32 {
    2048
}
fn default_server_binary() -> PathBuf {
    PathBuf::from("llama-server")
}
fn default_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    8089
}
fn default_startup_timeout_seconds() -> u64 {
    120
}
fn default_quote_base_url() -> String {
    DEFAULT_QUOTE_BASE_URL.to_string()
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

/// The pocketchat home directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Home {
    pub dir: PathBuf,
}

impl Home {
    /// Resolve and create the home directory.
    ///
    /// Precedence:
    /// 1. `home_override` (from --home)
    /// 2. `POCKETCHAT_HOME` environment variable
    /// 3. `~/.pocketchat`
    pub fn resolve(home_override: Option<PathBuf>) -> io::Result<Self> {
        let dir = if let Some(path) = home_override {
            path
        } else if let Ok(pocketchat_home) = std::env::var("POCKETCHAT_HOME") {
            PathBuf::from(pocketchat_home)
        } else {
            let home = home_dir()
                .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "Home directory not found"))?;
            home.join(".pocketchat")
        };
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.toml")
    }

    pub fn load_config(&self) -> io::Result<Config> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|e| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("Failed to parse config: {}", e),
            )
        })
    }
}
