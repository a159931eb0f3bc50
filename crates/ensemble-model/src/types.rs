use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// User and system messages may mix text with references to images and
/// files.  References are URLs, data URLs (`data:<mime>;base64,<b64>`) or
/// opaque provider file ids; decoding is out of scope — parts are framed
/// and passed through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageRef {
        /// Data URL or HTTPS URL.
        image_url: String,
    },
    FileRef {
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::ImageRef { image_url: image_url.into() }
    }
}

/// The body of a user/system/assistant message: a plain string or an
/// ordered sequence of parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Plain text view: the string itself, or all text parts joined.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn char_len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    // Conservative flat estimate for referenced media.
                    ContentPart::ImageRef { .. } | ContentPart::FileRef { .. } => 765 * 4,
                })
                .sum(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ─── Message types ────────────────────────────────────────────────────────────

/// Role of a non-assistant chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Developer,
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    InProgress,
    Completed,
    Incomplete,
}

/// Metadata carried by every message variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    /// Model that produced this message, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// An opaque reasoning block attached to an assistant message.
///
/// The signature is provider-issued and must be forwarded verbatim when the
/// message is replayed; it is never inspected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThinkingBlock {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// A user, system or developer message.
    Chat {
        role: ChatRole,
        content: MessageContent,
        #[serde(flatten)]
        meta: MessageMeta,
    },
    /// An assistant response, optionally with a thinking block.
    Assistant {
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<ThinkingBlock>,
        #[serde(flatten)]
        meta: MessageMeta,
    },
    /// The assistant requested a tool invocation.
    FunctionCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        call_id: String,
        name: String,
        /// JSON-encoded argument object
        arguments: String,
        #[serde(flatten)]
        meta: MessageMeta,
    },
    /// The result of a tool invocation.
    FunctionCallOutput {
        call_id: String,
        name: String,
        output: String,
        #[serde(flatten)]
        meta: MessageMeta,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::Chat {
            role: ChatRole::System,
            content: MessageContent::Text(text.into()),
            meta: MessageMeta::default(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::Chat {
            role: ChatRole::User,
            content: MessageContent::Text(text.into()),
            meta: MessageMeta::default(),
        }
    }

    pub fn developer(text: impl Into<String>) -> Self {
        Self::Chat {
            role: ChatRole::Developer,
            content: MessageContent::Text(text.into()),
            meta: MessageMeta::default(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: MessageContent::Text(text.into()),
            thinking: None,
            meta: MessageMeta::default(),
        }
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::FunctionCall {
            id: None,
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
            meta: MessageMeta::default(),
        }
    }

    pub fn function_call_output(
        call_id: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::FunctionCallOutput {
            call_id: call_id.into(),
            name: name.into(),
            output: output.into(),
            meta: MessageMeta::default(),
        }
    }

    /// Set the message status, consuming and returning self.
    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.meta_mut().status = Some(status);
        self
    }

    /// Stamp the producing model, consuming and returning self.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.meta_mut().model = Some(model.into());
        self
    }

    pub fn meta(&self) -> &MessageMeta {
        match self {
            Self::Chat { meta, .. }
            | Self::Assistant { meta, .. }
            | Self::FunctionCall { meta, .. }
            | Self::FunctionCallOutput { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut MessageMeta {
        match self {
            Self::Chat { meta, .. }
            | Self::Assistant { meta, .. }
            | Self::FunctionCall { meta, .. }
            | Self::FunctionCallOutput { meta, .. } => meta,
        }
    }

    /// The tool call id, for the two function variants.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::FunctionCall { call_id, .. } | Self::FunctionCallOutput { call_id, .. } => {
                Some(call_id)
            }
            _ => None,
        }
    }

    /// Plain text of the message body, if it has one.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Chat { content, .. } | Self::Assistant { content, .. } => {
                Some(content.as_text())
            }
            _ => None,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Self::Chat {
                role: ChatRole::System,
                ..
            }
        )
    }

    /// Approximate token count used for context management.
    ///
    /// Uses a 4-chars-per-token heuristic over all textual fields; media
    /// references count as a flat 765-token estimate.
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            Self::Chat { content, .. } => content.char_len(),
            Self::Assistant {
                content, thinking, ..
            } => content.char_len() + thinking.as_ref().map_or(0, |t| t.content.len()),
            Self::FunctionCall {
                name, arguments, ..
            } => name.len() + arguments.len(),
            Self::FunctionCallOutput { output, .. } => output.len(),
        };
        chars.div_ceil(4).max(1)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
