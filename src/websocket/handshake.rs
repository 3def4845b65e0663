//! RFC 6455 §1.3 handshake: accept-key derivation and sub-protocol
//! negotiation.

use crate::http::request::InternalRequest;
use crate::http::types::HeaderMap;
use base64::Engine;
use sha1::{Digest, Sha1};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`
/// (RFC 6455 §1.3, worked example: `"dGhlIHNhbXBsZSBub25jZQ=="` accepts as
/// `"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="`).
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// True iff `request` carries the full websocket upgrade header set:
/// `Upgrade: websocket` + `Connection: Upgrade` +
/// `Sec-WebSocket-Version: 13` + `Sec-WebSocket-Key`.
pub fn is_upgrade_request(request: &InternalRequest) -> bool {
    is_upgrade_headers(&request.headers)
}

/// Same check, usable by the HTTP/1 driver before an `InternalRequest` has
/// been assembled (it needs to branch to the gateway before a body emitter
/// is even created).
pub fn is_upgrade_headers(headers: &HeaderMap) -> bool {
    header_token_matches(headers, "upgrade", "websocket")
        && header_token_matches(headers, "connection", "upgrade")
        && headers.get("sec-websocket-version") == Some("13")
        && headers.get("sec-websocket-key").is_some()
}

fn header_token_matches(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get(name)
        .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

/// Picks the first client-offered sub-protocol the application accepts,
/// in the order the client listed them.
pub fn negotiate_subprotocol(request: &InternalRequest, supported: &[&str]) -> Option<String> {
    let offered = request.header("sec-websocket-protocol")?;
    offered
        .split(',')
        .map(|s| s.trim())
        .find(|candidate| supported.iter().any(|s| s.eq_ignore_ascii_case(candidate)))
        .map(|s| s.to_string())
}

/// Same negotiation, directly from headers (used by the HTTP/1 driver at
/// the handshake point, before an `InternalRequest` exists).
pub fn negotiate_subprotocol_headers(headers: &HeaderMap, supported: &[&str]) -> Option<String> {
    let offered = headers.get("sec-websocket-protocol")?;
    offered
        .split(',')
        .map(|s| s.trim())
        .find(|candidate| supported.iter().any(|s| s.eq_ignore_ascii_case(candidate)))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_worked_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn negotiate_picks_first_supported_offer() {
        let mut headers = crate::http::types::HeaderMap::new();
        headers.append("sec-websocket-protocol", "chat, superchat");
        let request = sample_request(headers);
        assert_eq!(
            negotiate_subprotocol(&request, &["superchat"]).as_deref(),
            Some("superchat")
        );
    }

    fn sample_request(headers: crate::http::types::HeaderMap) -> InternalRequest {
        use crate::http::body::BodyEmitter;
        use crate::http::request::{Locals, Trace};
        use crate::http::types::{Method, Uri, Version};
        use std::collections::HashMap;

        let (_emitter, message) = BodyEmitter::new(4096, 4096);
        InternalRequest {
            method: Method::Get,
            uri: Uri::parse_origin_form("/ws").unwrap(),
            protocol: Version::Http11,
            headers,
            cookies: HashMap::new(),
            trace: Trace::Http1(String::new()),
            stream_id: 0,
            time: 0,
            http_date: String::new(),
            max_body_size: 4096,
            body: message,
            middleware_index: 0,
            filter_error_flag: false,
            locals: Locals::default(),
        }
    }
}
