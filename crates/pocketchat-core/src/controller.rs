//! The chat controller.
//!
//! [`ChatController`] owns everything a chat session needs: the message list,
//! the active context, the conversation id and the configuration. Every user
//! action is a method; every outcome, including failures, is reported to a
//! [`ChatSink`] and recorded as a message. Errors are only returned when the
//! sink itself fails.

use crate::backend::{ContextParams, InferenceBackend, InferenceContext, StopHandle};
use crate::command::SlashCommand;
use crate::config::Config;
use crate::functions;
use crate::logging::{self, COMPLETIONS_LOG, DebugKey, PROMPTS_LOG};
use crate::message::{Action, Author, Message, Metadata, new_id, now_millis, reduce};
use crate::prompt::{PromptStyle, build_prompt};
use crate::quote::QuoteClient;
use crate::sink::{ChatEvent, ChatSink};
use crate::staging::{self, StagedModel};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const DEFAULT_CONVERSATION_ID: &str = "default";

pub const NO_MODEL_NOTICE: &str = "No model loaded. Use /model <path> to load a GGUF model.";

pub const NO_COMPLETION_NOTICE: &str = "No completion in progress.";

const COMMAND_HELP: &str = "You can use the following commands:\n\n\
    - /bench: to benchmark the model\n\
    - /release: release the context\n\
    - /stop: stop the current completion\n\
    - /reset: reset the conversation\n\
    - /save-session: save the session to disk\n\
    - /load-session: restore the saved session";

const BENCH_PP: u32 = 512;
const BENCH_TG: u32 = 128;
const HEAT_UP_LIMIT_MS: u128 = 10_000;

pub struct ChatController<B: InferenceBackend> {
    backend: B,
    context: Option<B::Context>,
    /// Oldest first.
    messages: Vec<Message>,
    conversation_id: String,
    inferencing: bool,
    config: Config,
    home: PathBuf,
    quotes: QuoteClient,
    debug: Vec<DebugKey>,
}

impl<B: InferenceBackend> ChatController<B> {
    pub fn new(backend: B, config: Config, home: PathBuf) -> Self {
        let quotes = QuoteClient::new(&config.quotes);
        Self {
            backend,
            context: None,
            messages: Vec::new(),
            conversation_id: DEFAULT_CONVERSATION_ID.to_string(),
            inferencing: false,
            config,
            home,
            quotes,
            debug: Vec::new(),
        }
    }

    /// Enable JSONL debug logs in the home directory.
    pub fn with_debug(mut self, debug: Vec<DebugKey>) -> Self {
        self.debug = debug;
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    pub fn is_inferencing(&self) -> bool {
        self.inferencing
    }

    pub fn style(&self) -> PromptStyle {
        self.config.prompt_style
    }

    /// A handle that stops the running completion from another task.
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.context.as_ref().map(|c| c.stop_handle())
    }

    fn apply(&mut self, action: Action) {
        self.messages = reduce(&self.messages, action);
    }

    fn notify<S: ChatSink>(&mut self, text: impl Into<String>, sink: &mut S) -> io::Result<()> {
        self.post_notice(Message::notice(text), sink)
    }

    fn post_notice<S: ChatSink>(&mut self, notice: Message, sink: &mut S) -> io::Result<()> {
        sink.handle(ChatEvent::Notice(&notice))?;
        self.apply(Action::Add(notice));
        Ok(())
    }

    fn turn_metadata(&self, context_id: &str) -> Metadata {
        Metadata::in_conversation(Some(context_id), &self.conversation_id)
    }

    /// Stage `path` if configured, then initialize a context on it.
    pub async fn load_model<S: ChatSink>(&mut self, path: &Path, sink: &mut S) -> io::Result<()> {
        let model = if self.config.stage_models {
            let models_dir = self.config.models_dir(&self.home);
            if staging::needs_copy(path, &models_dir) {
                self.notify("Copying model to internal storage...", sink)?;
            }
            match staging::stage_model(path, &models_dir) {
                Ok(StagedModel::Copied(staged)) => {
                    self.notify("Model copied!", sink)?;
                    staged
                }
                Ok(StagedModel::Reused(staged)) => staged,
                Err(e) => return self.notify(format!("Model copy failed: {}", e), sink),
            }
        } else {
            path.to_path_buf()
        };
        self.init_context(&model, sink).await
    }

    /// Release any current context and load `model`.
    pub async fn init_context<S: ChatSink>(&mut self, model: &Path, sink: &mut S) -> io::Result<()> {
        self.release_context(sink).await?;
        self.notify("Initializing context...", sink)?;

        let params = ContextParams {
            model: model.to_path_buf(),
            n_gpu_layers: self.config.context.n_gpu_layers,
            use_mlock: self.config.context.use_mlock,
            n_ctx: self.config.context.n_ctx,
        };
        match self.backend.init_context(&params).await {
            Ok(context) => {
                let text = format!(
                    "Context initialized! \n\nGPU: {} ({})\n\n{}",
                    if context.gpu() { "YES" } else { "NO" },
                    context.reason_no_gpu(),
                    COMMAND_HELP
                );
                log::info!("Context {} loaded {}", context.id(), model.display());
                self.context = Some(context);
                self.notify(text, sink)
            }
            Err(e) => self.notify(format!("Context initialization failed: {}", e), sink),
        }
    }

    /// Release the current context. Does nothing without one. On failure the
    /// context is kept.
    pub async fn release_context<S: ChatSink>(&mut self, sink: &mut S) -> io::Result<()> {
        if self.context.is_none() {
            return Ok(());
        }
        self.notify("Releasing context...", sink)?;
        let result = match &self.context {
            Some(context) => context.release().await,
            None => return Ok(()),
        };
        match result {
            Ok(()) => {
                self.context = None;
                self.notify("Context released!", sink)
            }
            Err(e) => self.notify(format!("Context release failed: {}", e), sink),
        }
    }

    /// Handle one line of user input: a slash command or a chat message.
    pub async fn send<S: ChatSink>(&mut self, text: &str, sink: &mut S) -> io::Result<()> {
        match SlashCommand::parse(text) {
            Some(SlashCommand::Model(path)) => return self.load_model(&path, sink).await,
            Some(command) if self.context.is_some() => return self.run_command(command, sink).await,
            _ => {}
        }
        if self.context.is_none() {
            return self.notify(NO_MODEL_NOTICE, sink);
        }
        self.chat(text, sink).await
    }

    async fn run_command<S: ChatSink>(
        &mut self,
        command: SlashCommand,
        sink: &mut S,
    ) -> io::Result<()> {
        match command {
            SlashCommand::Bench => self.bench(sink).await,
            SlashCommand::Release => self.release_context(sink).await,
            // Commands only run between completions. A running one is
            // stopped through `stop_handle()`.
            SlashCommand::Stop => self.notify(NO_COMPLETION_NOTICE, sink),
            SlashCommand::Reset => {
                self.conversation_id = new_id();
                self.notify("Conversation reset!", sink)
            }
            SlashCommand::SaveSession => self.save_session(sink).await,
            SlashCommand::LoadSession => self.load_session(sink).await,
            SlashCommand::Model(path) => self.load_model(&path, sink).await,
        }
    }

    async fn chat<S: ChatSink>(&mut self, text: &str, sink: &mut S) -> io::Result<()> {
        let Some(context_id) = self.context.as_ref().map(|c| c.id().to_string()) else {
            return self.notify(NO_MODEL_NOTICE, sink);
        };
        // A stop left over from an earlier request must not cut this turn.
        if let Some(context) = &self.context {
            context.stop_handle().reset();
        }
        let user = Message::new(Author::User, text, self.turn_metadata(&context_id));
        self.apply(Action::Add(user));

        let mut rounds = 0;
        while let Some(raw) = self.complete(&context_id, sink).await? {
            if !self.config.function_calls_enabled() {
                break;
            }
            let Some(result) = functions::respond_to(&raw, &self.quotes).await else {
                break;
            };
            let message = Message::new(Author::Function, result, self.turn_metadata(&context_id));
            sink.handle(ChatEvent::FunctionResult(&message))?;
            self.apply(Action::Add(message));

            if rounds >= self.config.max_function_rounds {
                break;
            }
            rounds += 1;
        }
        Ok(())
    }

    /// Run one completion over the conversation, streaming it into a new
    /// assistant message. Returns the raw model text, or `None` when the
    /// completion failed or was stopped.
    async fn complete<S: ChatSink>(
        &mut self,
        context_id: &str,
        sink: &mut S,
    ) -> io::Result<Option<String>> {
        let Some(context) = self.context.as_ref() else {
            return Ok(None);
        };

        let prompt = build_prompt(
            self.config.prompt_style,
            Some(context_id),
            &self.conversation_id,
            &self.messages,
        );
        logging::log_to_jsonl(
            &self.home,
            &self.debug,
            DebugKey::PromptLog,
            PROMPTS_LOG,
            "prompt",
            &json!(prompt),
        );

        let started = Instant::now();
        match context.tokenize(&prompt).await {
            Ok(tokens) => log::debug!(
                "Prompt is {} tokens, tokenized in {}ms",
                tokens.len(),
                started.elapsed().as_millis()
            ),
            Err(e) => log::debug!("Tokenize failed: {}", e),
        }

        let params = self.config.completion_params().with_prompt(prompt);
        let id = new_id();
        let template = Message {
            id: id.clone(),
            author: Author::Assistant,
            created_at: now_millis(),
            text: String::new(),
            metadata: Metadata::in_conversation(Some(context_id), &self.conversation_id),
        };

        self.inferencing = true;
        let messages = &mut self.messages;
        let mut raw = String::new();
        let mut sink_error = None;
        let outcome = context
            .completion(&params, |token| {
                raw.push_str(token);
                let next = reduce(
                    messages.as_slice(),
                    Action::AppendToken {
                        id: id.clone(),
                        token: token.to_string(),
                        template: template.clone(),
                    },
                );
                *messages = next;
                if sink_error.is_none()
                    && let Err(e) = sink.handle(ChatEvent::Token(token))
                {
                    sink_error = Some(e);
                }
            })
            .await;
        self.inferencing = false;

        if let Some(e) = sink_error {
            return Err(e);
        }
        let completion = match outcome {
            Ok(completion) => completion,
            Err(e) => {
                self.notify(format!("Completion failed: {}", e), sink)?;
                return Ok(None);
            }
        };

        logging::log_to_jsonl(
            &self.home,
            &self.debug,
            DebugKey::CompletionLog,
            COMPLETIONS_LOG,
            "completion",
            &json!({
                "text": raw,
                "interrupted": completion.interrupted,
                "timings": completion.timings.summary(),
            }),
        );

        if completion.interrupted {
            sink.handle(ChatEvent::Finished { timings: None })?;
            return Ok(None);
        }
        let timings = completion.timings.summary();
        self.apply(Action::AttachTimings {
            id,
            timings: timings.clone(),
        });
        sink.handle(ChatEvent::Finished {
            timings: Some(&timings),
        })?;
        Ok(Some(raw))
    }

    async fn bench<S: ChatSink>(&mut self, sink: &mut S) -> io::Result<()> {
        self.notify("Heating up the model...", sink)?;
        let started = Instant::now();
        let warmup = match &self.context {
            Some(context) => context.bench(8, 4, 1, 1).await,
            None => return Ok(()),
        };
        if let Err(e) = warmup {
            return self.notify(format!("Benchmark failed: {}", e), sink);
        }
        let heat_up = started.elapsed().as_millis();
        if heat_up > HEAT_UP_LIMIT_MS {
            return self.notify("Heat up time is too long, please try again.", sink);
        }
        self.notify(format!("Heat up time: {}ms", heat_up), sink)?;

        self.notify("Benchmarking the model...", sink)?;
        let result = match &self.context {
            Some(context) => context.bench(BENCH_PP, BENCH_TG, 1, 3).await,
            None => return Ok(()),
        };
        match result {
            Ok(result) => {
                let mut notice = Message::notice(result.to_markdown(BENCH_PP, BENCH_TG));
                notice.metadata.copyable = true;
                self.post_notice(notice, sink)
            }
            Err(e) => self.notify(format!("Benchmark failed: {}", e), sink),
        }
    }

    async fn save_session<S: ChatSink>(&mut self, sink: &mut S) -> io::Result<()> {
        let path = self.config.session_file(&self.home);
        let result = match &self.context {
            Some(context) => context.save_session(&path).await,
            None => return Ok(()),
        };
        match result {
            Ok(tokens_saved) => {
                log::info!("Session tokens saved: {}", tokens_saved);
                self.notify(format!("Session saved! {} tokens saved.", tokens_saved), sink)
            }
            Err(e) => {
                log::warn!("Session save failed: {}", e);
                self.notify(format!("Session save failed: {}", e), sink)
            }
        }
    }

    async fn load_session<S: ChatSink>(&mut self, sink: &mut S) -> io::Result<()> {
        let path = self.config.session_file(&self.home);
        let result = match &self.context {
            Some(context) => context.load_session(&path).await,
            None => return Ok(()),
        };
        match result {
            Ok(tokens_loaded) => {
                log::info!("Session loaded: {} tokens", tokens_loaded);
                self.notify(format!("Session loaded! {} tokens loaded.", tokens_loaded), sink)
            }
            Err(e) => {
                log::warn!("Session load failed: {}", e);
                self.notify(format!("Session load failed: {}", e), sink)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;
    use crate::test_support::ScriptedBackend;
    use mockito::Matcher;
    use std::fs;
    use tempfile::TempDir;

    const TIMINGS: &str = "20ms per token, 49.02 tokens per second";

    fn controller(
        backend: &ScriptedBackend,
        style: PromptStyle,
        home: &TempDir,
    ) -> ChatController<ScriptedBackend> {
        let config = Config {
            prompt_style: style,
            ..Default::default()
        };
        ChatController::new(backend.clone(), config, home.path().to_path_buf())
    }

    async fn loaded(
        backend: &ScriptedBackend,
        style: PromptStyle,
        home: &TempDir,
    ) -> (ChatController<ScriptedBackend>, CollectingSink) {
        let mut chat = controller(backend, style, home);
        let mut sink = CollectingSink::new();
        chat.load_model(Path::new("/models/tiny.gguf"), &mut sink)
            .await
            .unwrap();
        assert!(chat.has_context());
        (chat, CollectingSink::new())
    }

    fn quote_body(price: f64) -> String {
        format!(
            r#"{{"chart":{{"result":[{{"meta":{{"regularMarketPrice":{}}}}}]}}}}"#,
            price
        )
    }

    #[tokio::test]
    async fn test_send_without_context() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let mut chat = controller(&backend, PromptStyle::Instruct, &home);
        let mut sink = CollectingSink::new();

        chat.send("hello", &mut sink).await.unwrap();
        chat.send("/bench", &mut sink).await.unwrap();

        assert_eq!(sink.notice_texts(), vec![NO_MODEL_NOTICE, NO_MODEL_NOTICE]);
        assert_eq!(chat.messages().len(), 2);
        assert!(chat.messages().iter().all(Message::is_notice));
        assert!(backend.calls().is_empty());
        assert!(chat.stop_handle().is_none());
    }

    #[tokio::test]
    async fn test_init_context_notices() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let mut chat = controller(&backend, PromptStyle::Instruct, &home);
        let mut sink = CollectingSink::new();

        chat.load_model(Path::new("/models/tiny.gguf"), &mut sink)
            .await
            .unwrap();

        let notices = sink.notice_texts();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0], "Initializing context...");
        assert!(notices[1].starts_with(
            "Context initialized! \n\nGPU: NO (scripted)\n\nYou can use the following commands:\n\n- /bench: to benchmark the model\n"
        ));
        assert_eq!(backend.calls(), vec!["init /models/tiny.gguf"]);
        assert!(chat.stop_handle().is_some());
    }

    #[tokio::test]
    async fn test_init_context_failure() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        backend.script.lock().unwrap().fail_init = Some("out of memory".to_string());
        let mut chat = controller(&backend, PromptStyle::Instruct, &home);
        let mut sink = CollectingSink::new();

        chat.send("/model /models/huge.gguf", &mut sink).await.unwrap();

        assert_eq!(
            sink.notice_texts(),
            vec![
                "Initializing context...",
                "Context initialization failed: out of memory"
            ]
        );
        assert!(!chat.has_context());
    }

    #[tokio::test]
    async fn test_reinit_releases_previous_context() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Instruct, &home).await;

        chat.send("/model /models/other.gguf", &mut sink).await.unwrap();

        assert_eq!(
            backend.calls(),
            vec!["init /models/tiny.gguf", "release", "init /models/other.gguf"]
        );
        assert_eq!(
            &sink.notice_texts()[..3],
            &["Releasing context...", "Context released!", "Initializing context..."]
        );
    }

    #[tokio::test]
    async fn test_chat_streams_into_one_assistant_message() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::with_replies(&[&[" ", " Hel", "lo", "!"]]);
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Chat, &home).await;

        chat.send("hi", &mut sink).await.unwrap();

        assert_eq!(sink.text, "  Hello!");
        assert_eq!(sink.finished, vec![Some(TIMINGS.to_string())]);
        assert!(!chat.is_inferencing());

        let turns: Vec<&Message> = chat.messages().iter().filter(|m| !m.is_notice()).collect();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].author, Author::User);
        assert_eq!(turns[0].text, "hi");
        assert_eq!(turns[0].metadata.context_id.as_deref(), Some("ctx-1"));
        assert_eq!(turns[0].metadata.conversation_id.as_deref(), Some("default"));
        assert_eq!(turns[1].author, Author::Assistant);
        assert_eq!(turns[1].text, "Hello!");
        assert_eq!(turns[1].metadata.timings.as_deref(), Some(TIMINGS));

        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].ends_with("<|im_start|>user\n\n hi <|im_end|>\n\n <|im_start|>assistant \n"));
        assert!(!prompts[0].contains("Context initialized"));
    }

    #[tokio::test]
    async fn test_history_is_sent_back() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::with_replies(&[&["Hi there"], &["Fine"]]);
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Instruct, &home).await;

        chat.send("hello", &mut sink).await.unwrap();
        chat.send("how are you?", &mut sink).await.unwrap();

        let prompts = backend.prompts();
        assert!(prompts[1].contains(
            "### Input\n\n hello \n\n### Response\n Hi there\n\n### Input\n\n how are you? \n\n ### Response: \n"
        ));
    }

    #[tokio::test]
    async fn test_completion_failure_notice() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        backend
            .script
            .lock()
            .unwrap()
            .replies
            .push_back(Err("context full".to_string()));
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Instruct, &home).await;

        chat.send("hi", &mut sink).await.unwrap();

        assert_eq!(sink.notice_texts(), vec!["Completion failed: context full"]);
        assert!(sink.finished.is_empty());
        assert!(!chat.is_inferencing());
    }

    #[tokio::test]
    async fn test_function_call_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let quote = server
            .mock("GET", "/v8/finance/chart/AAPL")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(quote_body(189.84))
            .create_async()
            .await;

        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::with_replies(&[
            &[
                "{message: 'Let me check', ",
                "function_call: {name: 'stock_price', arguments: {symbol: 'AAPL'}}}",
            ],
            &["Apple trades at $189.84."],
        ]);
        let mut config = Config::default();
        config.quotes.base_url = server.url();
        let mut chat = ChatController::new(backend.clone(), config, home.path().to_path_buf());
        let mut sink = CollectingSink::new();
        chat.load_model(Path::new("/models/tiny.gguf"), &mut sink)
            .await
            .unwrap();

        chat.send("What is AAPL trading at?", &mut sink).await.unwrap();

        quote.assert_async().await;
        assert_eq!(sink.function_results.len(), 1);
        assert_eq!(
            sink.function_results[0].text,
            "Regular Market Price for AAPL: $189.84"
        );

        let turns: Vec<(Author, &str)> = chat
            .messages()
            .iter()
            .filter(|m| !m.is_notice())
            .map(|m| (m.author, m.text.as_str()))
            .collect();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[2], (Author::Function, "Regular Market Price for AAPL: $189.84"));
        assert_eq!(turns[3], (Author::Assistant, "Apple trades at $189.84."));

        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains(
            "###\nInstruction:\n\nHere is the response from the function\n Regular Market Price for AAPL: $189.84\n"
        ));
    }

    #[tokio::test]
    async fn test_function_rounds_limit_follow_ups() {
        let mut server = mockito::Server::new_async().await;
        let _quote = server
            .mock("GET", "/v8/finance/chart/MSFT")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(quote_body(410.0))
            .create_async()
            .await;

        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::with_replies(&[&[
            r#"function_call: {"name": "stock_price", "arguments": {"symbol": "MSFT"}}"#,
        ]]);
        let mut config = Config::default();
        config.quotes.base_url = server.url();
        config.max_function_rounds = 0;
        let mut chat = ChatController::new(backend.clone(), config, home.path().to_path_buf());
        let mut sink = CollectingSink::new();
        chat.load_model(Path::new("/m.gguf"), &mut sink).await.unwrap();

        chat.send("MSFT?", &mut sink).await.unwrap();

        assert_eq!(backend.prompts().len(), 1);
        assert_eq!(
            sink.function_results[0].text,
            "Regular Market Price for MSFT: $410"
        );
    }

    #[tokio::test]
    async fn test_failed_lookup_adds_nothing() {
        let mut server = mockito::Server::new_async().await;
        let _quote = server
            .mock("GET", "/v8/finance/chart/ZZZZ")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::with_replies(&[&[
            "function_call: {name: stock_price, arguments: {symbol: ZZZZ}}",
        ]]);
        let mut config = Config::default();
        config.quotes.base_url = server.url();
        let mut chat = ChatController::new(backend.clone(), config, home.path().to_path_buf());
        let mut sink = CollectingSink::new();
        chat.load_model(Path::new("/m.gguf"), &mut sink).await.unwrap();

        chat.send("ZZZZ?", &mut sink).await.unwrap();

        assert!(sink.function_results.is_empty());
        assert_eq!(backend.prompts().len(), 1);
        assert!(
            chat.messages()
                .iter()
                .all(|m| m.author != Author::Function)
        );
    }

    #[tokio::test]
    async fn test_chat_style_skips_function_calls() {
        let mut server = mockito::Server::new_async().await;
        let quote = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::with_replies(&[&[
            "function_call: {name: stock_price, arguments: {symbol: AAPL}}",
        ]]);
        let mut config = Config {
            prompt_style: PromptStyle::Chat,
            ..Default::default()
        };
        config.quotes.base_url = server.url();
        let mut chat = ChatController::new(backend.clone(), config, home.path().to_path_buf());
        let mut sink = CollectingSink::new();
        chat.load_model(Path::new("/m.gguf"), &mut sink).await.unwrap();

        chat.send("AAPL?", &mut sink).await.unwrap();

        quote.assert_async().await;
        assert!(sink.function_results.is_empty());
    }

    #[tokio::test]
    async fn test_release_command() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Instruct, &home).await;

        chat.send("/release", &mut sink).await.unwrap();
        assert_eq!(
            sink.notice_texts(),
            vec!["Releasing context...", "Context released!"]
        );
        assert!(!chat.has_context());

        // Nothing left to release.
        chat.release_context(&mut sink).await.unwrap();
        assert_eq!(sink.notices.len(), 2);
    }

    #[tokio::test]
    async fn test_release_failure_keeps_context() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Instruct, &home).await;
        backend.script.lock().unwrap().fail_release = Some("busy".to_string());

        chat.send("/release", &mut sink).await.unwrap();

        assert_eq!(
            sink.notice_texts(),
            vec!["Releasing context...", "Context release failed: busy"]
        );
        assert!(chat.has_context());
    }

    #[tokio::test]
    async fn test_reset_starts_new_conversation() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::with_replies(&[&["one"], &["two"]]);
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Instruct, &home).await;

        chat.send("first question", &mut sink).await.unwrap();
        chat.send("/reset", &mut sink).await.unwrap();
        assert_ne!(chat.conversation_id(), DEFAULT_CONVERSATION_ID);
        assert_eq!(sink.notice_texts(), vec!["Conversation reset!"]);

        chat.send("second question", &mut sink).await.unwrap();
        let prompts = backend.prompts();
        assert!(prompts[1].contains("second question"));
        assert!(!prompts[1].contains("first question"));
    }

    /// Stops the completion as soon as the first token arrives.
    struct StopAfterFirstToken {
        inner: CollectingSink,
        stop: StopHandle,
    }

    impl ChatSink for StopAfterFirstToken {
        fn handle(&mut self, event: ChatEvent<'_>) -> io::Result<()> {
            if let ChatEvent::Token(_) = event {
                self.stop.stop();
            }
            self.inner.handle(event)
        }
    }

    #[tokio::test]
    async fn test_stop_when_idle_notices() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Instruct, &home).await;

        chat.send("/stop", &mut sink).await.unwrap();

        assert_eq!(sink.notice_texts(), vec![NO_COMPLETION_NOTICE]);
        assert!(!chat.stop_handle().unwrap().is_stopped());
    }

    #[tokio::test]
    async fn test_stop_mid_stream_keeps_partial_reply() {
        let mut server = mockito::Server::new_async().await;
        let quote = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::with_replies(&[&[
            "function_call: {name: stock_price, ",
            "arguments: {symbol: AAPL}}",
        ]]);
        let mut config = Config::default();
        config.quotes.base_url = server.url();
        let mut chat = ChatController::new(backend.clone(), config, home.path().to_path_buf());
        let mut collecting = CollectingSink::new();
        chat.load_model(Path::new("/m.gguf"), &mut collecting)
            .await
            .unwrap();

        let stop = chat.stop_handle().unwrap();
        let mut sink = StopAfterFirstToken {
            inner: CollectingSink::new(),
            stop: stop.clone(),
        };
        chat.send("AAPL?", &mut sink).await.unwrap();

        quote.assert_async().await;
        assert_eq!(sink.inner.text, "function_call: {name: stock_price, ");
        assert_eq!(sink.inner.finished, vec![None]);
        assert!(sink.inner.function_results.is_empty());
        assert!(!chat.is_inferencing());
        assert!(!stop.is_stopped());

        let reply = chat.messages().last().unwrap();
        assert_eq!(reply.author, Author::Assistant);
        assert_eq!(reply.text, "function_call: {name: stock_price, ");
        assert_eq!(reply.metadata.timings, None);
        assert_eq!(backend.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_stop_does_not_cut_next_turn() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::with_replies(&[&["Hello", " again"]]);
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Chat, &home).await;

        chat.stop_handle().unwrap().stop();
        chat.send("hi", &mut sink).await.unwrap();

        assert_eq!(sink.text, "Hello again");
        assert_eq!(sink.finished, vec![Some(TIMINGS.to_string())]);
    }

    #[tokio::test]
    async fn test_session_save_and_load() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Instruct, &home).await;

        chat.send("/save-session", &mut sink).await.unwrap();
        chat.send("/load-session", &mut sink).await.unwrap();

        assert_eq!(
            sink.notice_texts(),
            vec!["Session saved! 42 tokens saved.", "Session loaded! 42 tokens loaded."]
        );
        let session = home.path().join("llama-session.bin");
        let calls = backend.calls();
        assert!(calls.contains(&format!("save {}", session.display())));
        assert!(calls.contains(&format!("load {}", session.display())));
    }

    #[tokio::test]
    async fn test_session_failures() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Instruct, &home).await;
        backend.script.lock().unwrap().fail_session = Some("disk full".to_string());

        chat.send("/save-session", &mut sink).await.unwrap();
        chat.send("/load-session", &mut sink).await.unwrap();

        assert_eq!(
            sink.notice_texts(),
            vec!["Session save failed: disk full", "Session load failed: disk full"]
        );
    }

    #[tokio::test]
    async fn test_bench_reports_table() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let (mut chat, mut sink) = loaded(&backend, PromptStyle::Instruct, &home).await;

        chat.send("/bench", &mut sink).await.unwrap();

        let notices = sink.notice_texts();
        assert_eq!(notices.len(), 4);
        assert_eq!(notices[0], "Heating up the model...");
        assert!(notices[1].starts_with("Heat up time: "));
        assert!(notices[1].ends_with("ms"));
        assert_eq!(notices[2], "Benchmarking the model...");
        assert!(notices[3].starts_with("| model | size | params | test | t/s |\n"));
        assert!(notices[3].contains("| tiny Q4_0 | 2.00 GiB | 3.00B | pp 512 | 100.00 ± 1.50 |"));
        assert!(sink.notices[3].metadata.copyable);

        let calls = backend.calls();
        assert!(calls.contains(&"bench 8 4 1 1".to_string()));
        assert!(calls.contains(&"bench 512 128 1 3".to_string()));
    }

    #[tokio::test]
    async fn test_staging_copies_before_init() {
        let home = TempDir::new().unwrap();
        let downloads = TempDir::new().unwrap();
        let source = downloads.path().join("tiny-q4");
        fs::write(&source, b"gguf").unwrap();

        let backend = ScriptedBackend::default();
        let config = Config {
            stage_models: true,
            ..Default::default()
        };
        let mut chat = ChatController::new(backend.clone(), config, home.path().to_path_buf());
        let mut sink = CollectingSink::new();

        chat.load_model(&source, &mut sink).await.unwrap();
        chat.release_context(&mut sink).await.unwrap();
        chat.load_model(&source, &mut sink).await.unwrap();

        let staged = home.path().join("models").join("tiny-q4.gguf");
        assert!(staged.is_file());
        assert_eq!(
            &sink.notice_texts()[..3],
            &[
                "Copying model to internal storage...",
                "Model copied!",
                "Initializing context..."
            ]
        );
        // The second load reuses the staged copy without copying again.
        let copies = sink
            .notice_texts()
            .iter()
            .filter(|n| *n == &"Model copied!")
            .count();
        assert_eq!(copies, 1);
        assert_eq!(
            backend.calls().iter().filter(|c| c.starts_with("init")).count(),
            2
        );
        assert!(backend.calls()[0].ends_with("tiny-q4.gguf"));
    }

    #[tokio::test]
    async fn test_staging_failure_notice() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::default();
        let config = Config {
            stage_models: true,
            ..Default::default()
        };
        let mut chat = ChatController::new(backend.clone(), config, home.path().to_path_buf());
        let mut sink = CollectingSink::new();

        chat.load_model(&home.path().join("nope.bin"), &mut sink)
            .await
            .unwrap();

        let notices = sink.notice_texts();
        assert_eq!(notices[0], "Copying model to internal storage...");
        assert!(notices[1].starts_with("Model copy failed: Model file not found"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_debug_logs_prompts_and_completions() {
        let home = TempDir::new().unwrap();
        let backend = ScriptedBackend::with_replies(&[&["ok"]]);
        let mut chat = controller(&backend, PromptStyle::Chat, &home).with_debug(vec![DebugKey::All]);
        let mut sink = CollectingSink::new();
        chat.load_model(Path::new("/m.gguf"), &mut sink).await.unwrap();

        chat.send("hi", &mut sink).await.unwrap();

        let prompts = fs::read_to_string(home.path().join(PROMPTS_LOG)).unwrap();
        assert_eq!(prompts.lines().count(), 1);
        let completions = fs::read_to_string(home.path().join(COMPLETIONS_LOG)).unwrap();
        let entry: serde_json::Value = serde_json::from_str(completions.trim()).unwrap();
        assert_eq!(entry["completion"]["text"], "ok");
        assert_eq!(chat.style(), PromptStyle::Chat);
    }
}
