//! Demo edge device built on the transport.
//!
//! Each client sends one JSON object with a `topic` field and gets one reply:
//! - `random-data`: the request echoed back with `value` set to a random
//!   number between 10 and 109 (as a string)
//! - any other topic: `invalid topic`
//! - anything that is not JSON: `invalid json data`
//!
//! The connection is closed after the reply.

use crate::transport::{
    Client, ConnectionId, LoopMode, Server, TransportConfig, TransportError,
};
use bytes::Bytes;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub const TOPIC_RANDOM_DATA: &str = "random-data";

const INVALID_TOPIC: &[u8] = b"invalid topic";
const INVALID_JSON: &[u8] = b"invalid json data";

/// Build the reply for one request payload.
pub fn handle_request(payload: &[u8]) -> Vec<u8> {
    let mut request: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!(line = e.line(), column = e.column(), "Received invalid JSON");
            return INVALID_JSON.to_vec();
        }
    };

    if request.get("topic").and_then(Value::as_str) != Some(TOPIC_RANDOM_DATA) {
        warn!(request = %request, "Invalid topic");
        return INVALID_TOPIC.to_vec();
    }

    let value = rand::rng().random_range(10..110).to_string();
    request["value"] = Value::String(value);
    request.to_string().into_bytes()
}

/// Accept clients and answer each one until the listener closes.
///
/// Per-connection failures are logged and never stop the loop; only a
/// listener failure is returned.
pub fn serve(server: &mut Server, loop_mode: LoopMode) -> Result<(), TransportError> {
    loop {
        let id = match server.accept(loop_mode) {
            Ok(id) => id,
            Err(TransportError::AcceptTimedOut) => continue,
            Err(e) => return Err(e),
        };

        serve_one(server, id);

        if !server.is_listening() {
            info!("Listener closed, stopping");
            return Ok(());
        }
    }
}

/// Read one request from `id`, reply and close.
pub fn serve_one(server: &mut Server, id: ConnectionId) {
    let request = match server.read(id, 0) {
        Ok(bytes) => bytes,
        // Nothing arrived in time; answered like an empty message
        Err(TransportError::NoDataAvailable) => Bytes::new(),
        Err(e) => {
            debug!(conn_id = %id, error = %e, "Read failed, closing");
            close(server, id);
            return;
        }
    };

    let reply = handle_request(&request);
    match server.write(id, &reply) {
        Ok(sent) => info!(conn_id = %id, reply = %String::from_utf8_lossy(sent), "Replied"),
        Err(e) => warn!(conn_id = %id, error = %e, "Write failed"),
    }
    close(server, id);
}

fn close(server: &mut Server, id: ConnectionId) {
    if let Err(e) = server.close(id) {
        warn!(conn_id = %id, error = %e, "Close failed");
    }
}

/// Send one `topic` request to `host:port` and return the reply.
pub fn request(
    host: &str,
    port: u16,
    topic: &str,
    config: TransportConfig,
) -> Result<Bytes, TransportError> {
    let mut client = Client::connect(host, port, config)?;
    let payload = json!({ "topic": topic }).to_string();

    let reply = client
        .write(payload.as_bytes())
        .and_then(|_| client.read(0));
    if let Err(e) = client.close() {
        warn!(error = %e, "Close failed");
    }
    reply
}
