//! Backend driving llama.cpp's `llama-server` over HTTP.
//!
//! The server is either spawned per context with the model on its command
//! line, or an already running instance is attached to via `server.url`.

use super::{
    BenchResult, CompletionParams, CompletionResult, ContextParams, InferenceBackend,
    InferenceContext, StopHandle, Timings,
};
use crate::config::ServerConfig;
use crate::message::new_id;
use futures_util::stream::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Prompt text whose first token fills benchmark prompts.
const BENCH_TOKEN_TEXT: &str = " the";

#[derive(Serialize)]
struct CompletionRequest<'a> {
    #[serde(flatten)]
    params: &'a CompletionParams,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    timings: Option<Timings>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct TimedResponse {
    #[serde(default)]
    timings: Timings,
}

#[derive(Deserialize)]
struct TokenizeResponse {
    tokens: Vec<i64>,
}

#[derive(Deserialize)]
struct DetokenizeResponse {
    content: String,
}

#[derive(Deserialize)]
struct SlotSaveResponse {
    n_saved: usize,
}

#[derive(Deserialize)]
struct SlotRestoreResponse {
    n_restored: usize,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    meta: ModelMeta,
}

#[derive(Default, Deserialize)]
struct ModelMeta {
    #[serde(default)]
    n_params: u64,
    #[serde(default)]
    size: u64,
}

pub struct LlamaServerBackend {
    config: ServerConfig,
    client: Client,
}

impl LlamaServerBackend {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn spawn(&self, params: &ContextParams) -> io::Result<Child> {
        let mut command = Command::new(&self.config.binary);
        command
            .arg("-m")
            .arg(&params.model)
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("-ngl")
            .arg(params.n_gpu_layers.to_string())
            .arg("-c")
            .arg(params.n_ctx.to_string());
        if params.use_mlock {
            command.arg("--mlock");
        }
        if let Some(dir) = &self.config.slot_save_path {
            command.arg("--slot-save-path").arg(dir);
        }
        command
            .args(&self.config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        log::debug!("Starting {:?}", command.as_std());
        command.spawn().map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to start {}: {}", self.config.binary.display(), e),
            )
        })
    }
}

impl InferenceBackend for LlamaServerBackend {
    type Context = LlamaServerContext;

    async fn init_context(&self, params: &ContextParams) -> io::Result<LlamaServerContext> {
        let (base_url, child) = match &self.config.url {
            Some(url) => {
                log::debug!(
                    "Attaching to llama-server at {}, {} is not loaded here",
                    url,
                    params.model.display()
                );
                (url.trim_end_matches('/').to_string(), None)
            }
            None => {
                if !params.model.is_file() {
                    return Err(io::Error::new(
                        ErrorKind::NotFound,
                        format!("Model file not found: {}", params.model.display()),
                    ));
                }
                let child = self.spawn(params)?;
                (
                    format!("http://{}:{}", self.config.host, self.config.port),
                    Some(child),
                )
            }
        };

        let attached = child.is_none();
        let gpu = params.n_gpu_layers > 0;
        let context = LlamaServerContext {
            id: new_id(),
            client: self.client.clone(),
            base_url,
            child: Mutex::new(child),
            stop: StopHandle::default(),
            gpu,
            reason_no_gpu: if gpu {
                String::new()
            } else {
                "n_gpu_layers is 0".to_string()
            },
        };

        let timeout = Duration::from_secs(self.config.startup_timeout_seconds);
        if let Err(e) = context.wait_until_ready(timeout, attached).await {
            let _ = context.release().await;
            return Err(e);
        }
        log::info!("llama-server ready at {}", context.base_url);
        Ok(context)
    }
}

/// A model loaded in a `llama-server` instance.
pub struct LlamaServerContext {
    id: String,
    client: Client,
    base_url: String,
    /// The spawned server, if we own it.
    child: Mutex<Option<Child>>,
    stop: StopHandle,
    gpu: bool,
    reason_no_gpu: String,
}

impl LlamaServerContext {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn wait_until_ready(&self, timeout: Duration, attached: bool) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(child) = self.child.lock().await.as_mut()
                && let Some(status) = child.try_wait()?
            {
                return Err(io::Error::other(format!(
                    "llama-server exited during startup ({})",
                    status
                )));
            }

            match self.client.get(self.url("/health")).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                // Still loading the model.
                Ok(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => {}
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(io::Error::other(format!("API error ({}): {}", status, body)));
                }
                Err(e) if attached => {
                    return Err(io::Error::new(
                        ErrorKind::ConnectionRefused,
                        format!("Failed to reach llama-server at {}: {}", self.base_url, e),
                    ));
                }
                Err(_) => {}
            }

            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    ErrorKind::TimedOut,
                    format!("llama-server not ready after {}s", timeout.as_secs()),
                ));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> io::Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(send_error)?;
        decode(check_status(response).await?, path).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> io::Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(send_error)?;
        decode(check_status(response).await?, path).await
    }

    async fn model_entry(&self) -> io::Result<ModelEntry> {
        let models: ModelsResponse = self.get_json("/v1/models").await?;
        models
            .data
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "llama-server lists no model"))
    }
}

impl InferenceContext for LlamaServerContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn gpu(&self) -> bool {
        self.gpu
    }

    fn reason_no_gpu(&self) -> &str {
        &self.reason_no_gpu
    }

    async fn completion<F>(
        &self,
        params: &CompletionParams,
        on_token: F,
    ) -> io::Result<CompletionResult>
    where
        F: FnMut(&str),
    {
        let result = self.stream_completion(params, on_token).await;
        self.stop.reset();
        result
    }

    async fn tokenize(&self, text: &str) -> io::Result<Vec<i64>> {
        let response: TokenizeResponse = self
            .post_json("/tokenize", &json!({ "content": text }))
            .await?;
        Ok(response.tokens)
    }

    async fn detokenize(&self, tokens: &[i64]) -> io::Result<String> {
        let response: DetokenizeResponse = self
            .post_json("/detokenize", &json!({ "tokens": tokens }))
            .await?;
        Ok(response.content)
    }

    async fn bench(&self, pp: u32, tg: u32, pl: u32, nr: u32) -> io::Result<BenchResult> {
        if pl > 1 {
            log::debug!("Benchmarking one sequence at a time, ignoring pl={}", pl);
        }
        let model = self.model_entry().await?;
        let token = self
            .tokenize(BENCH_TOKEN_TEXT)
            .await?
            .first()
            .copied()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "Tokenizer returned no tokens"))?;

        let mut pp_rates = Vec::new();
        let mut tg_rates = Vec::new();
        for _ in 0..nr.max(1) {
            let body = json!({
                "prompt": vec![token; pp as usize],
                "n_predict": tg,
                "cache_prompt": false,
                "ignore_eos": true,
                "stream": false,
            });
            let response: TimedResponse = self.post_json("/completion", &body).await?;
            pp_rates.push(response.timings.prompt_per_second);
            tg_rates.push(response.timings.predicted_per_second);
        }

        let (pp_avg, pp_std) = mean_and_std(&pp_rates);
        let (tg_avg, tg_std) = mean_and_std(&tg_rates);
        let model_desc = Path::new(&model.id)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(model.id.clone());
        Ok(BenchResult {
            model_desc,
            model_size: model.meta.size,
            model_n_params: model.meta.n_params,
            pp_avg,
            pp_std,
            tg_avg,
            tg_std,
        })
    }

    async fn save_session(&self, path: &Path) -> io::Result<usize> {
        let filename = slot_filename(path)?;
        let response: SlotSaveResponse = self
            .post_json("/slots/0?action=save", &json!({ "filename": filename }))
            .await?;
        Ok(response.n_saved)
    }

    async fn load_session(&self, path: &Path) -> io::Result<usize> {
        let filename = slot_filename(path)?;
        let response: SlotRestoreResponse = self
            .post_json("/slots/0?action=restore", &json!({ "filename": filename }))
            .await?;
        Ok(response.n_restored)
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    async fn release(&self) -> io::Result<()> {
        let mut child = self.child.lock().await;
        if let Some(process) = child.as_mut()
            && process.try_wait()?.is_none()
        {
            process
                .kill()
                .await
                .map_err(|e| io::Error::other(format!("Failed to stop llama-server: {}", e)))?;
        }
        *child = None;
        Ok(())
    }
}

impl LlamaServerContext {
    /// Stream one completion. A stop requested before the request is sent
    /// interrupts it without contacting the server.
    async fn stream_completion<F>(
        &self,
        params: &CompletionParams,
        mut on_token: F,
    ) -> io::Result<CompletionResult>
    where
        F: FnMut(&str),
    {
        if self.stop.is_stopped() {
            return Ok(CompletionResult {
                interrupted: true,
                ..Default::default()
            });
        }
        let response = self
            .client
            .post(self.url("/completion"))
            .json(&CompletionRequest {
                params,
                stream: true,
            })
            .send()
            .await
            .map_err(send_error)?;
        let mut stream = check_status(response).await?.bytes_stream();

        let mut result = CompletionResult::default();
        // Bytes of an SSE line split across chunks.
        let mut pending: Vec<u8> = Vec::new();

        'stream: while let Some(chunk_result) = stream.next().await {
            let chunk =
                chunk_result.map_err(|e| io::Error::other(format!("Stream error: {}", e)))?;
            pending.extend_from_slice(&chunk);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = std::str::from_utf8(&line)
                    .map_err(|e| io::Error::other(format!("UTF-8 error: {}", e)))?;
                let Some(data) = line.trim_end().strip_prefix("data: ") else {
                    continue;
                };

                let chunk: CompletionChunk = serde_json::from_str(data)
                    .map_err(|e| io::Error::other(format!("JSON parse error: {}", e)))?;
                if let Some(error) = chunk.error {
                    return Err(io::Error::other(format!("llama-server error: {}", error)));
                }
                if !chunk.content.is_empty() {
                    on_token(&chunk.content);
                    result.text.push_str(&chunk.content);
                }
                if chunk.stop {
                    result.timings = chunk.timings.unwrap_or_default();
                    break 'stream;
                }
                if self.stop.is_stopped() {
                    result.interrupted = true;
                    break 'stream;
                }
            }
        }
        Ok(result)
    }
}

fn send_error(e: reqwest::Error) -> io::Error {
    io::Error::other(format!("Failed to send request: {}", e))
}

async fn check_status(response: Response) -> io::Result<Response> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(io::Error::other(format!("API error ({}): {}", status, body)));
    }
    Ok(response)
}

async fn decode<T: DeserializeOwned>(response: Response, path: &str) -> io::Result<T> {
    response.json().await.map_err(|e| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("Failed to decode {} response: {}", path, e),
        )
    })
}

/// Sessions live in the server's slot directory; only the file name is sent.
fn slot_filename(path: &Path) -> io::Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("Session path has no file name: {}", path.display()),
            )
        })
}

/// Mean and sample standard deviation.
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}
