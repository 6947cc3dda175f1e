//! The duplex client's private sub-protocol: login handshake, heartbeat
//! ping/pong, and the sequence header server pushes carry (spec.md §4.2).
//!
//! These opcodes are reserved on the wire; everything else passes through
//! to the caller's message/push handlers untouched.

use serde::{Deserialize, Serialize};

pub const OPCODE_LOGIN_REQ: u16 = 1;
pub const OPCODE_LOGIN_RESP: u16 = 2;
pub const OPCODE_HEARTBEAT_PING: u16 = 3;
pub const OPCODE_HEARTBEAT_PONG: u16 = 4;

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginReq {
    pub token: String,
    pub client_version: String,
    pub device_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResp {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub ping_seq: u64,
    pub client_millis: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatPong {
    pub ping_seq: u64,
    pub client_millis_echo: i64,
}

/// Server pushes (opcodes classified [`crate::codec::OpcodeClass::Push`] by
/// [`crate::codec::classify`]) carry an 8-byte big-endian sequence number
/// ahead of their payload, used for the client's dedup/ordering check.
pub const PUSH_SEQ_LEN: usize = 8;

pub fn split_push_seq(body: &[u8]) -> Option<(u64, &[u8])> {
    if body.len() < PUSH_SEQ_LEN {
        return None;
    }
    let seq = u64::from_be_bytes(body[..PUSH_SEQ_LEN].try_into().expect("slice is 8 bytes"));
    Some((seq, &body[PUSH_SEQ_LEN..]))
}
