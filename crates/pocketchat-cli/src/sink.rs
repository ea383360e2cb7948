//! Terminal sink: streams tokens to stdout and prints notices inline.

use pocketchat_core::{ChatEvent, ChatSink};
use std::io::{self, Write};

pub struct TerminalSink<W: Write> {
    out: W,
    /// A token was written since the last newline.
    mid_line: bool,
}

impl<W: Write> TerminalSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            mid_line: false,
        }
    }

    fn end_line(&mut self) -> io::Result<()> {
        if self.mid_line {
            writeln!(self.out)?;
            self.mid_line = false;
        }
        Ok(())
    }
}

impl<W: Write> ChatSink for TerminalSink<W> {
    fn handle(&mut self, event: ChatEvent<'_>) -> io::Result<()> {
        match event {
            ChatEvent::Token(token) => {
                // The first token of a reply usually starts with whitespace.
                let token = if self.mid_line {
                    token
                } else {
                    token.trim_start()
                };
                if !token.is_empty() {
                    write!(self.out, "{}", token)?;
                    self.out.flush()?;
                    self.mid_line = true;
                }
            }
            ChatEvent::Notice(message) => {
                self.end_line()?;
                writeln!(self.out, "[system] {}", message.text)?;
            }
            ChatEvent::FunctionResult(message) => {
                self.end_line()?;
                writeln!(self.out, "[function] {}", message.text)?;
            }
            ChatEvent::Finished { timings } => {
                self.end_line()?;
                if let Some(timings) = timings {
                    log::info!("{}", timings);
                }
            }
        }
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocketchat_core::Message;

    fn render(events: &[ChatEvent<'_>]) -> String {
        let mut sink = TerminalSink::new(Vec::new());
        for event in events {
            sink.handle(event.clone()).unwrap();
        }
        String::from_utf8(sink.out).unwrap()
    }

    #[test]
    fn test_tokens_then_finish() {
        let out = render(&[
            ChatEvent::Token("  Hel"),
            ChatEvent::Token("lo there"),
            ChatEvent::Finished {
                timings: Some("20ms per token"),
            },
        ]);
        assert_eq!(out, "Hello there\n");
    }

    #[test]
    fn test_notice_breaks_line() {
        let notice = Message::notice("Completion failed: boom");
        let result = Message::notice("Regular Market Price for AAPL: $1");
        let out = render(&[
            ChatEvent::Token("partial"),
            ChatEvent::Notice(&notice),
            ChatEvent::FunctionResult(&result),
        ]);
        assert_eq!(
            out,
            "partial\n[system] Completion failed: boom\n[function] Regular Market Price for AAPL: $1\n"
        );
    }

    #[test]
    fn test_interrupted_finish_ends_line_once() {
        let out = render(&[
            ChatEvent::Token("abc"),
            ChatEvent::Finished { timings: None },
            ChatEvent::Finished { timings: None },
        ]);
        assert_eq!(out, "abc\n");
    }
}
