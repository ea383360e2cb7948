//! Chat sink abstraction for decoupling the controller from presentation.
//!
//! The controller emits [`ChatEvent`]s without knowing whether they end up
//! on a terminal, in a test buffer or somewhere else.

use crate::message::Message;
use std::io;

/// Events emitted while the controller works.
#[derive(Debug, Clone)]
pub enum ChatEvent<'a> {
    /// A piece of streamed assistant text.
    Token(&'a str),

    /// A system notice (status, failures, bench results).
    Notice(&'a Message),

    /// The result of a function call, about to be fed back to the model.
    FunctionResult(&'a Message),

    /// A completion finished. Carries the timings summary when one is known.
    Finished { timings: Option<&'a str> },
}

/// Trait for handling chat events.
///
/// # Example
///
/// ```
/// use pocketchat_core::{ChatEvent, ChatSink};
/// use std::io;
///
/// struct Transcript(String);
///
/// impl ChatSink for Transcript {
///     fn handle(&mut self, event: ChatEvent<'_>) -> io::Result<()> {
///         if let ChatEvent::Token(token) = event {
///             self.0.push_str(token);
///         }
///         Ok(())
///     }
/// }
///
/// let mut sink = Transcript(String::new());
/// sink.handle(ChatEvent::Token("Hi")).unwrap();
/// assert_eq!(sink.0, "Hi");
/// ```
pub trait ChatSink {
    fn handle(&mut self, event: ChatEvent<'_>) -> io::Result<()>;
}

/// A sink that collects events for programmatic use and tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    /// Streamed text of every completion, concatenated.
    pub text: String,
    pub notices: Vec<Message>,
    pub function_results: Vec<Message>,
    /// Timings of each finished completion, in order.
    pub finished: Vec<Option<String>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notice texts, in order.
    pub fn notice_texts(&self) -> Vec<&str> {
        self.notices.iter().map(|m| m.text.as_str()).collect()
    }
}

impl ChatSink for CollectingSink {
    fn handle(&mut self, event: ChatEvent<'_>) -> io::Result<()> {
        match event {
            ChatEvent::Token(token) => self.text.push_str(token),
            ChatEvent::Notice(message) => self.notices.push(message.clone()),
            ChatEvent::FunctionResult(message) => self.function_results.push(message.clone()),
            ChatEvent::Finished { timings } => self.finished.push(timings.map(str::to_string)),
        }
        Ok(())
    }
}
