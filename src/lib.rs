//! Recording, replay and timeline analysis core for a real-time game
//! protocol benchmarking harness.
//!
//! A benchmarking run wires four pieces together:
//!
//! - [`codec`] frames opcode + payload onto the wire and classifies
//!   opcodes as request, response or server push.
//! - [`client`] (behind the default `ws` feature) is a reconnecting,
//!   heartbeating WebSocket client that drives a session against a real
//!   server, or [`proxy`] sits transparently between an existing client and
//!   server and tees frames in both directions.
//! - [`session`] accumulates everything either path observes into an
//!   immutable [`session::SessionRecord`], and [`replay`] plays one back
//!   later at real, scaled, or as-fast-as-possible speed.
//! - [`analyzer`] turns a finished record into message-flow and latency
//!   metrics, and [`assert`] runs named pass/fail checks against it.
//!
//! Nothing here is transport-agnostic by design — the wire format, the
//! login handshake and the push sequencing convention are all concrete, so
//! that a recorded session means the same thing no matter which of
//! `client` or `proxy` produced it.

pub mod analyzer;
pub mod assert;
#[cfg(feature = "ws")]
pub mod client;
pub mod codec;
pub mod error;
#[cfg(feature = "ws")]
pub mod proxy;
pub mod replay;
pub mod session;

pub use analyzer::TimelineAnalyzer;
pub use assert::{Assertion, AssertionEngine, AssertionResult, EngineReport};
#[cfg(feature = "ws")]
pub use client::{ClientConfig, ClientError, ClientState, DuplexClient};
pub use codec::{DecodeError, FrameDecoder, OpcodeClass};
pub use error::SerializationError;
#[cfg(feature = "ws")]
pub use proxy::{ProxyConfig, ProxyError, ProxyStatus, RecordingProxy};
pub use replay::{ReplayConfig, ReplayError, ReplayStats, Replayer};
pub use session::{
    CloseCode, Direction, EventType, LatencyPercentiles, MessageFrame, Recorder, SessionEvent,
    SessionRecord, SessionStats,
};
