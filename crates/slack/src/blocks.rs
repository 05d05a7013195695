//! Block Kit message building blocks.
//!
//! Every text-producing constructor truncates its input to [`MAX_TEXT_LENGTH`]
//! so a single oversized field never causes Slack to reject the whole message.

use serde::{Deserialize, Serialize};

/// Upper bound for any text emitted into a block, in characters.
pub const MAX_TEXT_LENGTH: usize = 2000;

/// Appended to text that was cut short.
pub const TRUNCATION_MARKER: &str = "[TRUNCATED]";

/// Truncate `text` so the result, marker included, fits in `max_len` characters.
#[must_use]
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }

    let keep = max_len.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// A Slack text object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TextObject {
    #[serde(rename = "mrkdwn")]
    Markdown { text: String },
    #[serde(rename = "plain_text")]
    PlainText { text: String },
}

impl TextObject {
    /// Markdown text, truncated to the shared limit.
    #[must_use]
    pub fn markdown(text: &str) -> Self {
        Self::Markdown {
            text: truncate_text(text, MAX_TEXT_LENGTH),
        }
    }

    /// Plain text, truncated to the shared limit.
    #[must_use]
    pub fn plain(text: &str) -> Self {
        Self::PlainText {
            text: truncate_text(text, MAX_TEXT_LENGTH),
        }
    }

    /// The text content.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Markdown { text } | Self::PlainText { text } => text,
        }
    }
}

/// A single layout block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    /// Text section
    Section { text: TextObject },
    /// Image pulled by Slack from a public URL
    Image {
        image_url: String,
        alt_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<TextObject>,
    },
    /// Small, muted context line
    Context { elements: Vec<TextObject> },
}

impl Block {
    /// Markdown section block.
    #[must_use]
    pub fn section(text: &str) -> Self {
        Self::Section {
            text: TextObject::markdown(text),
        }
    }

    /// Chart image block, titled and with `metric graph <title>` as alt text.
    #[must_use]
    pub fn chart_image(url: &str, title: &str) -> Self {
        Self::Image {
            image_url: url.to_string(),
            alt_text: truncate_text(&format!("metric graph {title}"), MAX_TEXT_LENGTH),
            title: Some(TextObject::plain(title)),
        }
    }

    /// Footer rendered as a single markdown context element.
    #[must_use]
    pub fn footer(text: &str) -> Self {
        Self::Context {
            elements: vec![TextObject::markdown(text)],
        }
    }
}

/// A message ready to be posted or written over an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutgoingMessage {
    /// Target channel ID or name
    pub channel: String,
    /// Attachment side-bar color (`#rrggbb`)
    pub color: Option<String>,
    /// Layout blocks
    pub blocks: Vec<Block>,
    /// Thread to reply into, if any
    pub thread_ts: Option<String>,
    /// Also show a threaded reply in the channel
    pub broadcast: bool,
}

/// Where a posted message ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedMessage {
    /// Channel ID as reported by Slack
    pub channel: String,
    /// Message timestamp, Slack's message identifier
    pub ts: String,
}
