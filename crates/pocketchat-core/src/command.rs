//! Slash commands typed into the chat.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Bench,
    Release,
    Stop,
    Reset,
    SaveSession,
    LoadSession,
    /// Load (and stage) a model file.
    Model(PathBuf),
}

impl SlashCommand {
    /// Parse `text` as a command. Anything that is not an exact command is a
    /// chat message and yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let command = match text {
            "/bench" => SlashCommand::Bench,
            "/release" => SlashCommand::Release,
            "/stop" => SlashCommand::Stop,
            "/reset" => SlashCommand::Reset,
            "/save-session" => SlashCommand::SaveSession,
            "/load-session" => SlashCommand::LoadSession,
            _ => {
                let path = text.strip_prefix("/model ")?.trim();
                if path.is_empty() {
                    return None;
                }
                SlashCommand::Model(PathBuf::from(path))
            }
        };
        Some(command)
    }
}
