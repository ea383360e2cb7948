//! Conversation messages and the reducer that updates them.
//!
//! The message list is never edited in place. Every change is expressed as an
//! [`Action`] and applied with [`reduce`], which returns a new list. Messages
//! are kept oldest first.

use serde::{Deserialize, Serialize};

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    /// Model replies and system notices.
    Assistant,
    /// Output of an executed function call, fed back to the model.
    Function,
}

impl Author {
    /// Stable author id, matching the ids used by the chat UI.
    pub fn id(&self) -> &'static str {
        match self {
            Author::User => "y9d7f8pgn",
            Author::Assistant => "h3o3lc5xj",
            Author::Function => "f7c2k0qbd",
        }
    }
}

/// Free-form message metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Notices are shown to the user but never sent to the model.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Human-readable generation speed, attached once a completion ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub copyable: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Metadata {
    /// Metadata for a message that belongs to a conversation on a context.
    pub fn in_conversation(context_id: Option<&str>, conversation_id: &str) -> Self {
        Self {
            context_id: context_id.map(str::to_string),
            conversation_id: Some(conversation_id.to_string()),
            ..Default::default()
        }
    }

    /// Metadata for a system notice.
    pub fn notice() -> Self {
        Self {
            system: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub author: Author,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Message {
    pub fn new(author: Author, text: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: new_id(),
            author,
            created_at: now_millis(),
            text: text.into(),
            metadata,
        }
    }

    /// A system notice authored by the assistant.
    pub fn notice(text: impl Into<String>) -> Self {
        Self::new(Author::Assistant, text, Metadata::notice())
    }

    pub fn is_notice(&self) -> bool {
        self.metadata.system
    }
}

/// A change to the conversation.
#[derive(Debug, Clone)]
pub enum Action {
    /// Append a message to the end of the conversation.
    Add(Message),
    /// Append a streamed token to message `id`.
    ///
    /// If no message with that id exists yet, `template` is added with the
    /// token as its text.
    AppendToken {
        id: String,
        token: String,
        template: Message,
    },
    /// Record generation timings on message `id`.
    AttachTimings { id: String, timings: String },
}

/// Apply `action` to `messages`, returning the updated list.
pub fn reduce(messages: &[Message], action: Action) -> Vec<Message> {
    match action {
        Action::Add(message) => {
            let mut next = messages.to_vec();
            next.push(message);
            next
        }
        Action::AppendToken {
            id,
            token,
            template,
        } => {
            if messages.iter().any(|m| m.id == id) {
                messages
                    .iter()
                    .map(|m| {
                        if m.id == id {
                            let text = format!("{}{}", m.text, token);
                            Message {
                                text: text.trim_start().to_string(),
                                ..m.clone()
                            }
                        } else {
                            m.clone()
                        }
                    })
                    .collect()
            } else {
                let mut next = messages.to_vec();
                next.push(Message {
                    id,
                    text: token,
                    ..template
                });
                next
            }
        }
        Action::AttachTimings { id, timings } => messages
            .iter()
            .map(|m| {
                if m.id == id {
                    let mut updated = m.clone();
                    updated.metadata.timings = Some(timings.clone());
                    updated
                } else {
                    m.clone()
                }
            })
            .collect(),
    }
}

/// Short random id for messages and conversations.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..9].to_string()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
