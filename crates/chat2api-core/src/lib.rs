//! Upstream chat-stream transcoding core.
//!
//! Authenticates against a third-party conversational web backend with a
//! caller-supplied long-lived credential, submits a prompt, and converts the
//! backend's proprietary event stream (textual SSE in most variants, a
//! length-prefixed binary RPC framing in one) into a single normalized
//! incremental-delta protocol.
//!
//! Outbound HTTP and the proof-of-work digest are consumed through traits
//! ([`UpstreamClient`], [`PowSolver`]) so embedders and tests inject their
//! own; this crate performs no ambient IO of its own beyond the default
//! `wreq` client implementation.

pub mod challenge;
pub mod completions;
pub mod config;
pub mod error;
pub mod identity;
pub mod prompt;
pub mod retry;
pub mod session;
pub mod solver;
pub mod token;
pub mod transcode;
pub mod transport;
mod upstream;

pub use completions::{ChatCore, NormalizedStream};
pub use config::{UpstreamConfig, WireProtocol};
pub use error::{CoreError, CoreResult, TransportErrorKind};
pub use identity::{IdentitySet, IdentityTemplate};
pub use prompt::{ChatMessage, MessageContent};
pub use session::parse_conversation_ref;
pub use solver::PowSolver;
pub use token::{AccessToken, TokenCache};
pub use transcode::{CitationStyle, OutputPolicy, StreamTranscoder, ThinkingStyle};
pub use transport::{
    UpstreamClient, UpstreamClientConfig, UpstreamHttpRequest, UpstreamHttpResponse,
    WreqUpstreamClient,
};
