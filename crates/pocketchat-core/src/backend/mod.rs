//! Inference backends.
//!
//! A backend turns a model file into an [`InferenceContext`]. The context
//! streams completions, tokenizes, benchmarks and persists its KV cache.
//! [`LlamaServerBackend`] drives a llama.cpp `llama-server` process.

mod llama_server;

pub use llama_server::{LlamaServerBackend, LlamaServerContext};

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Options used when loading a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    pub model: PathBuf,
    /// Layers offloaded to the GPU. Zero keeps everything on the CPU.
    pub n_gpu_layers: u32,
    pub use_mlock: bool,
    pub n_ctx: u32,
}

/// A single completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionParams {
    pub prompt: String,
    /// Maximum tokens to generate, -1 for unbounded.
    pub n_predict: i32,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub repeat_penalty: f32,
    pub stop: Vec<String>,
}

impl CompletionParams {
    pub fn with_prompt(self, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..self
        }
    }
}

/// Generation speed reported at the end of a completion.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Timings {
    #[serde(default)]
    pub predicted_per_token_ms: f64,
    #[serde(default)]
    pub predicted_per_second: f64,
    #[serde(default)]
    pub prompt_per_second: f64,
}

impl Timings {
    /// e.g. `"21ms per token, 47.62 tokens per second"`
    pub fn summary(&self) -> String {
        format!(
            "{:.0}ms per token, {:.2} tokens per second",
            self.predicted_per_token_ms, self.predicted_per_second
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResult {
    pub text: String,
    pub timings: Timings,
    /// True when the completion ended because of a stop request.
    pub interrupted: bool,
}

/// Prompt-processing and generation throughput, in tokens per second.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchResult {
    pub model_desc: String,
    /// Model size in bytes.
    pub model_size: u64,
    pub model_n_params: u64,
    pub pp_avg: f64,
    pub pp_std: f64,
    pub tg_avg: f64,
    pub tg_std: f64,
}

impl BenchResult {
    /// Render as the markdown table llama-bench prints.
    pub fn to_markdown(&self, pp: u32, tg: u32) -> String {
        let size = format!("{:.2} GiB", self.model_size as f64 / 1024f64.powi(3));
        let params = format!("{:.2}B", self.model_n_params as f64 / 1e9);
        let mut table = String::from("| model | size | params | test | t/s |\n");
        table.push_str("| --- | --- | --- | --- | --- |\n");
        table.push_str(&format!(
            "| {} | {} | {} | pp {} | {:.2} ± {:.2} |\n",
            self.model_desc, size, params, pp, self.pp_avg, self.pp_std
        ));
        table.push_str(&format!(
            "| {} | {} | {} | tg {} | {:.2} ± {:.2}",
            self.model_desc, size, params, tg, self.tg_avg, self.tg_std
        ));
        table
    }
}

/// Shared flag that asks a running completion to finish early.
///
/// Cloning shares the flag, so a handle taken before a completion starts can
/// stop it from another task.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Loads models.
#[allow(async_fn_in_trait)]
pub trait InferenceBackend {
    type Context: InferenceContext;

    async fn init_context(&self, params: &ContextParams) -> io::Result<Self::Context>;
}

/// A loaded model.
#[allow(async_fn_in_trait)]
pub trait InferenceContext {
    /// Unique id of this context.
    fn id(&self) -> &str;

    fn gpu(&self) -> bool;

    /// Why the GPU is not in use. Empty when [`gpu`](Self::gpu) is true.
    fn reason_no_gpu(&self) -> &str;

    /// Run a completion, calling `on_token` for every generated piece of text.
    async fn completion<F>(
        &self,
        params: &CompletionParams,
        on_token: F,
    ) -> io::Result<CompletionResult>
    where
        F: FnMut(&str);

    async fn tokenize(&self, text: &str) -> io::Result<Vec<i64>>;

    async fn detokenize(&self, tokens: &[i64]) -> io::Result<String>;

    /// Measure throughput: `pp` prompt tokens, `tg` generated tokens,
    /// `pl` parallel sequences, `nr` repetitions.
    async fn bench(&self, pp: u32, tg: u32, pl: u32, nr: u32) -> io::Result<BenchResult>;

    /// Persist the KV cache, returning the number of tokens saved.
    async fn save_session(&self, path: &Path) -> io::Result<usize>;

    /// Restore a KV cache written by [`save_session`](Self::save_session),
    /// returning the number of tokens loaded.
    async fn load_session(&self, path: &Path) -> io::Result<usize>;

    fn stop_handle(&self) -> StopHandle;

    fn stop_completion(&self) {
        self.stop_handle().stop();
    }

    /// Free the model. The context must not be used afterwards.
    async fn release(&self) -> io::Result<()>;
}
