//! pocketchat-core: chat with a local model and recover function calls from its output.
//!
//! The [`ChatController`] owns the conversation and drives an
//! [`InferenceBackend`]: it stages a model file, initializes a context, turns
//! user input into prompts, streams completions into assistant messages and,
//! in instruct mode, scrapes `function_call` objects out of the replies and
//! runs them.
//!
//! # Quick Start
//!
//! ```no_run
//! use pocketchat_core::backend::LlamaServerBackend;
//! use pocketchat_core::{ChatController, CollectingSink, Home};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let home = Home::resolve(None)?;
//!     let config = home.load_config()?;
//!     let backend = LlamaServerBackend::new(config.server.clone());
//!     let mut chat = ChatController::new(backend, config, home.dir.clone());
//!     let mut sink = CollectingSink::new();
//!
//!     chat.load_model(Path::new("model.gguf"), &mut sink).await?;
//!     chat.send("What's the price of AAPL?", &mut sink).await?;
//!     println!("{}", sink.text);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod command;
pub mod config;
pub mod controller;
pub mod extract;
pub mod functions;
pub mod logging;
pub mod message;
pub mod prompt;
pub mod quote;
pub mod sink;
pub mod staging;

pub use backend::{InferenceBackend, InferenceContext, StopHandle};
pub use command::SlashCommand;
pub use config::{Config, Home};
pub use controller::ChatController;
pub use extract::{FunctionCall, extract};
pub use logging::DebugKey;
pub use message::{Action, Author, Message, Metadata, reduce};
pub use prompt::PromptStyle;
pub use quote::QuoteClient;
pub use sink::{ChatEvent, ChatSink, CollectingSink};

/// Shared test helpers: an in-memory backend with scripted replies.
#[cfg(test)]
pub(crate) mod test_support {
    use crate::backend::{
        BenchResult, CompletionParams, CompletionResult, ContextParams, InferenceBackend,
        InferenceContext, StopHandle, Timings,
    };
    use std::collections::VecDeque;
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// Everything the scripted backend was asked to do, in order.
    #[derive(Debug, Default)]
    pub(crate) struct Script {
        /// Token lists returned by successive completions. An `Err` entry
        /// makes that completion fail.
        pub replies: VecDeque<Result<Vec<String>, String>>,
        pub fail_init: Option<String>,
        pub fail_release: Option<String>,
        pub fail_session: Option<String>,
        pub calls: Vec<String>,
        pub prompts: Vec<String>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct ScriptedBackend {
        pub script: Arc<Mutex<Script>>,
    }

    impl ScriptedBackend {
        pub(crate) fn with_replies(replies: &[&[&str]]) -> Self {
            let backend = Self::default();
            backend.script.lock().unwrap().replies = replies
                .iter()
                .map(|tokens| Ok(tokens.iter().map(|t| t.to_string()).collect()))
                .collect();
            backend
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.script.lock().unwrap().calls.clone()
        }

        pub(crate) fn prompts(&self) -> Vec<String> {
            self.script.lock().unwrap().prompts.clone()
        }
    }

    pub(crate) struct ScriptedContext {
        id: String,
        script: Arc<Mutex<Script>>,
        stop: StopHandle,
    }

    impl InferenceBackend for ScriptedBackend {
        type Context = ScriptedContext;

        async fn init_context(&self, params: &ContextParams) -> io::Result<ScriptedContext> {
            let mut script = self.script.lock().unwrap();
            script
                .calls
                .push(format!("init {}", params.model.display()));
            if let Some(reason) = &script.fail_init {
                return Err(io::Error::other(reason.clone()));
            }
            Ok(ScriptedContext {
                id: "ctx-1".to_string(),
                script: Arc::clone(&self.script),
                stop: StopHandle::default(),
            })
        }
    }

    impl InferenceContext for ScriptedContext {
        fn id(&self) -> &str {
            &self.id
        }

        fn gpu(&self) -> bool {
            false
        }

        fn reason_no_gpu(&self) -> &str {
            "scripted"
        }

        async fn completion<F>(
            &self,
            params: &CompletionParams,
            mut on_token: F,
        ) -> io::Result<CompletionResult>
        where
            F: FnMut(&str),
        {
            let reply = {
                let mut script = self.script.lock().unwrap();
                script.calls.push("completion".to_string());
                script.prompts.push(params.prompt.clone());
                script.replies.pop_front()
            };
            let tokens = match reply {
                Some(Ok(tokens)) => tokens,
                Some(Err(reason)) => return Err(io::Error::other(reason)),
                None => vec![],
            };
            let mut text = String::new();
            let mut interrupted = self.stop.is_stopped();
            if !interrupted {
                for token in &tokens {
                    on_token(token);
                    text.push_str(token);
                    if self.stop.is_stopped() {
                        interrupted = true;
                        break;
                    }
                }
            }
            self.stop.reset();
            Ok(CompletionResult {
                text,
                timings: Timings {
                    predicted_per_token_ms: 20.4,
                    predicted_per_second: 49.0196,
                    ..Default::default()
                },
                interrupted,
            })
        }

        async fn tokenize(&self, text: &str) -> io::Result<Vec<i64>> {
            Ok(text.split_whitespace().enumerate().map(|(i, _)| i as i64).collect())
        }

        async fn detokenize(&self, tokens: &[i64]) -> io::Result<String> {
            Ok(tokens.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" "))
        }

        async fn bench(&self, pp: u32, tg: u32, pl: u32, nr: u32) -> io::Result<BenchResult> {
            self.script
                .lock()
                .unwrap()
                .calls
                .push(format!("bench {pp} {tg} {pl} {nr}"));
            Ok(BenchResult {
                model_desc: "tiny Q4_0".to_string(),
                model_size: 2 * 1024 * 1024 * 1024,
                model_n_params: 3_000_000_000,
                pp_avg: 100.0,
                pp_std: 1.5,
                tg_avg: 20.0,
                tg_std: 0.25,
            })
        }

        async fn save_session(&self, path: &Path) -> io::Result<usize> {
            let mut script = self.script.lock().unwrap();
            script.calls.push(format!("save {}", path.display()));
            match &script.fail_session {
                Some(reason) => Err(io::Error::other(reason.clone())),
                None => Ok(42),
            }
        }

        async fn load_session(&self, path: &Path) -> io::Result<usize> {
            let mut script = self.script.lock().unwrap();
            script.calls.push(format!("load {}", path.display()));
            match &script.fail_session {
                Some(reason) => Err(io::Error::other(reason.clone())),
                None => Ok(42),
            }
        }

        fn stop_handle(&self) -> StopHandle {
            self.stop.clone()
        }

        async fn release(&self) -> io::Result<()> {
            let mut script = self.script.lock().unwrap();
            script.calls.push("release".to_string());
            match &script.fail_release {
                Some(reason) => Err(io::Error::other(reason.clone())),
                None => Ok(()),
            }
        }
    }
}
