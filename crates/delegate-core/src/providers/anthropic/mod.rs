//! Anthropic Claude Messages API provider.
//!
//! The system prompt is sent as a single block with an ephemeral cache
//! breakpoint so repeated agent turns reuse it.

pub mod api;
mod sse;
pub(crate) mod types;

pub use api::{AnthropicClient, AnthropicConfig, DEFAULT_BASE_URL};
