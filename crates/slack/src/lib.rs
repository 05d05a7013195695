//! Chat delivery for alert threads.
//!
//! This crate owns the boundary between alert processing and Slack:
//!
//! - [`Block`] and [`OutgoingMessage`] model a Block Kit message wrapped in a
//!   single colored attachment
//! - [`truncate_text`] and [`MAX_TEXT_LENGTH`] are the one truncation rule every
//!   text-producing path shares
//! - [`ChatClient`] is the seam the processor talks to; [`SlackClient`] implements
//!   it over the Web API
//!
//! Threading is controlled per message: `thread_ts` turns a post into a reply and
//! `broadcast` additionally surfaces that reply in the channel.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod blocks;
pub mod client;
pub mod error;

pub use blocks::{
    truncate_text, Block, OutgoingMessage, PostedMessage, TextObject, MAX_TEXT_LENGTH,
    TRUNCATION_MARKER,
};
pub use client::SlackClient;
pub use error::DeliveryError;

use async_trait::async_trait;

/// Trait for chat backends that can post and rewrite messages.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Post a message, either top-level or as a thread reply.
    async fn post_message(&self, message: &OutgoingMessage) -> Result<PostedMessage, DeliveryError>;

    /// Replace the content of the message identified by `ts` in `message.channel`.
    async fn update_message(
        &self,
        ts: &str,
        message: &OutgoingMessage,
    ) -> Result<PostedMessage, DeliveryError>;
}
