mod cli;
mod sink;

use clap::Parser;
use cli::Cli;
use pocketchat_core::backend::LlamaServerBackend;
use pocketchat_core::{ChatController, Home, SlashCommand, StopHandle};
use sink::TerminalSink;
use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, IsTerminal, Write};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Exit status after an interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: i32 = 130;

const STOP_COMMAND: &str = "/stop";

/// Something the user did: typed a line, pressed Ctrl-C or closed stdin.
#[derive(Debug)]
enum Input {
    Line(String),
    Interrupt,
    Closed,
}

/// User input, read in the background so it keeps arriving while a request
/// runs.
struct Inputs {
    rx: mpsc::UnboundedReceiver<Input>,
    /// Lines typed while a request was running.
    queued: VecDeque<String>,
    /// Stdin reached EOF.
    closed: bool,
    /// Every sender is gone.
    disconnected: bool,
}

impl Inputs {
    fn new(rx: mpsc::UnboundedReceiver<Input>) -> Self {
        Self {
            rx,
            queued: VecDeque::new(),
            closed: false,
            disconnected: false,
        }
    }

    /// Start the stdin reader and the Ctrl-C watcher.
    fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let lines_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let input = match lines.next_line().await {
                    Ok(Some(line)) => Input::Line(line),
                    Ok(None) => Input::Closed,
                    Err(e) => {
                        log::warn!("Failed to read stdin: {}", e);
                        Input::Closed
                    }
                };
                let closed = matches!(input, Input::Closed);
                if lines_tx.send(input).is_err() || closed {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(Input::Interrupt).is_err() {
                    break;
                }
            }
        });

        Self::new(rx)
    }

    /// Next input while idle. Queued lines come first; `None` once stdin is
    /// closed and the queue is empty.
    async fn next(&mut self) -> Option<Input> {
        if let Some(line) = self.queued.pop_front() {
            return Some(Input::Line(line));
        }
        if self.closed || self.disconnected {
            return None;
        }
        match self.rx.recv().await {
            Some(Input::Closed) => {
                self.closed = true;
                None
            }
            Some(input) => Some(input),
            None => {
                self.disconnected = true;
                None
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Done,
    /// The user gave up on the request; it was dropped unfinished.
    Cancelled,
}

/// Run one controller request while watching input.
///
/// A `/stop` line or the first Ctrl-C stops the completion through `stop`.
/// A second Ctrl-C, or one with nothing to stop, cancels the request. Other
/// lines are queued for later.
async fn drive<F>(request: F, stop: Option<StopHandle>, inputs: &mut Inputs) -> io::Result<Outcome>
where
    F: Future<Output = io::Result<()>>,
{
    tokio::pin!(request);
    let mut stopping = false;
    loop {
        tokio::select! {
            result = &mut request => return result.map(|()| Outcome::Done),
            input = inputs.rx.recv(), if !inputs.disconnected => match input {
                Some(Input::Line(line)) if line.trim() == STOP_COMMAND && stop.is_some() => {
                    if let Some(stop) = &stop {
                        stop.stop();
                        stopping = true;
                    }
                }
                Some(Input::Line(line)) => inputs.queued.push_back(line),
                Some(Input::Interrupt) => match &stop {
                    Some(stop) if !stopping => {
                        log::debug!("Stopping completion");
                        stop.stop();
                        stopping = true;
                    }
                    _ => return Ok(Outcome::Cancelled),
                },
                Some(Input::Closed) => inputs.closed = true,
                None => inputs.disconnected = true,
            },
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn show_prompt(interactive: bool) -> io::Result<()> {
    if interactive {
        let mut out = io::stdout();
        write!(out, "> ")?;
        out.flush()?;
    }
    Ok(())
}

/// Run the chat session, returning the exit status.
async fn run(cli: Cli) -> io::Result<i32> {
    let home = Home::resolve(cli.home.clone())?;
    let mut config = home.load_config()?;
    cli.apply_overrides(&mut config);
    if config.server.slot_save_path.is_none() {
        config.server.slot_save_path = config
            .session_file(&home.dir)
            .parent()
            .map(Path::to_path_buf);
    }
    log::debug!("Home: {}", home.dir.display());

    let backend = LlamaServerBackend::new(config.server.clone());
    let mut chat = ChatController::new(backend, config, home.dir.clone()).with_debug(cli.debug_keys());
    let mut sink = TerminalSink::new(io::stdout());
    let mut inputs = Inputs::spawn();

    let mut status = 0;
    if let Some(model) = &cli.model {
        let outcome = drive(chat.load_model(model, &mut sink), None, &mut inputs).await?;
        if outcome == Outcome::Cancelled {
            status = EXIT_INTERRUPTED;
        }
    }

    let interactive = io::stdin().is_terminal();
    while status == 0 {
        show_prompt(interactive)?;
        let line = match inputs.next().await {
            Some(Input::Line(line)) => line,
            Some(Input::Interrupt) => {
                eprintln!();
                status = EXIT_INTERRUPTED;
                break;
            }
            Some(Input::Closed) | None => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "/quit" | "/exit") {
            break;
        }

        // Loading a model has no completion to stop.
        let stop = match SlashCommand::parse(line) {
            Some(SlashCommand::Model(_)) => None,
            _ => chat.stop_handle(),
        };
        if drive(chat.send(line, &mut sink), stop, &mut inputs).await? == Outcome::Cancelled {
            status = EXIT_INTERRUPTED;
        }
    }

    chat.release_context(&mut sink).await?;
    Ok(status)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let status = match run(cli).await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };
    // The stdin reader may still be blocked on a read; don't wait for it.
    std::process::exit(status);
}
