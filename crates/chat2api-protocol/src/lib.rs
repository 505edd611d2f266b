//! Wire formats for the chat transcoding core.
//!
//! This crate holds the downstream OpenAI-compatible DTOs, the SSE
//! parser/encoder, the classification of upstream stream envelopes, and the
//! length-prefixed binary frame codec used by the RPC upstream variant.
//! It performs no IO.

pub mod connect;
pub mod event;
pub mod openai;
pub mod sse;
