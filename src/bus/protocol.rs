//! Bus Wire Protocol
//!
//! HTTP endpoints exposed by the bus server and the DTOs of its unary calls.
//! The receive call is a Server-Sent Events stream carrying one JSON
//! [`MessageEnvelope`](super::types::MessageEnvelope) per `data:` line.

use serde::{Deserialize, Serialize};

pub const ENDPOINT_PING: &str = "/bus/ping";
pub const ENDPOINT_REGISTER: &str = "/bus/register";
pub const ENDPOINT_RECEIVE: &str = "/bus/receive";
pub const ENDPOINT_SEND: &str = "/bus/send";

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub host_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Ack {}
