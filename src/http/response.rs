//! The user-visible `Response` builder, the application-facing half of the
//! response pipeline.
//!
//! A fluent, state-guarded builder over a streaming `{STARTED, STREAMING,
//! ENDED}` bitmask, since a response body here may be produced
//! incrementally across suspension points instead of assembled
//! synchronously before the first write.

use crate::http::types::{HeaderMap, StatusCode, Version};
use crate::options::SERVER_TOKEN;
use bitflags::bitflags;
use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResponseState: u8 {
        const STARTED = 0b001;
        const STREAMING = 0b010;
        const ENDED = 0b100;
    }
}

/// Cookie attributes accepted by `Response::set_cookie`.
#[derive(Debug, Clone, Default)]
pub struct CookieFlags {
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<String>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<u64>,
    pub expires: Option<String>,
}

/// A streaming, user-visible HTTP response.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    cookies: Vec<(String, String, CookieFlags)>,
    body: Vec<Bytes>,
    /// Set only by `push()`.
    pushes: Vec<(String, HeaderMap)>,
    state: ResponseState,
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            reason: None,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            pushes: Vec::new(),
            state: ResponseState::empty(),
        }
    }

    #[track_caller]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        debug_assert!(
            !self.state.contains(ResponseState::ENDED),
            "status() called after end()"
        );
        self.status = status;
        self.state.insert(ResponseState::STARTED);
        self
    }

    pub fn reason(&mut self, reason: impl Into<String>) -> &mut Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.append(name, value);
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.set(name, value);
        self
    }

    /// Encodes a `Set-Cookie` entry; lowercased attribute names, and an
    /// `expires` attribute synthesized from `max-age` when absent.
    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>, flags: CookieFlags) -> &mut Self {
        self.cookies.push((name.into(), value.into(), flags));
        self
    }

    /// Appends a body chunk. Additional writes after `end()` are
    /// programmer errors in debug builds, no-ops in release.
    #[track_caller]
    pub fn write(&mut self, bytes: impl Into<Bytes>) -> &mut Self {
        debug_assert!(
            !self.state.contains(ResponseState::ENDED),
            "write() called after end()"
        );
        if !self.state.contains(ResponseState::ENDED) {
            self.body.push(bytes.into());
            self.state.insert(ResponseState::STREAMING);
        }
        self
    }

    /// Convenience wrapper around `write` for in-memory bodies.
    pub fn body(&mut self, bytes: impl Into<Bytes>) -> &mut Self {
        self.write(bytes)
    }

    /// Finalizes the response. Idempotent: a second call with an empty
    /// argument is a no-op; a second call carrying bytes is a programmer
    /// error.
    #[track_caller]
    pub fn end(&mut self, final_bytes: Option<Bytes>) -> &mut Self {
        if self.state.contains(ResponseState::ENDED) {
            debug_assert!(
                final_bytes.as_ref().map(|b| b.is_empty()).unwrap_or(true),
                "end(nonEmpty) called after an earlier end()"
            );
            return self;
        }
        if let Some(bytes) = final_bytes {
            if !bytes.is_empty() {
                self.body.push(bytes);
            }
        }
        self.state.insert(ResponseState::STARTED | ResponseState::ENDED);
        self
    }

    /// Registers a server push candidate; the HTTP/2 driver filters these
    /// to same-origin before issuing PUSH_PROMISE.
    pub fn push(&mut self, url: impl Into<String>, extra_headers: Option<HeaderMap>) -> &mut Self {
        self.pushes.push((url.into(), extra_headers.unwrap_or_default()));
        self
    }

    pub fn is_ended(&self) -> bool {
        self.state.contains(ResponseState::ENDED)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason.as_deref().unwrap_or(self.status.default_reason())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_chunks(&self) -> &[Bytes] {
        &self.body
    }

    pub fn take_body(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.body)
    }

    pub fn pushes(&self) -> &[(String, HeaderMap)] {
        &self.pushes
    }

    pub fn body_len(&self) -> usize {
        self.body.iter().map(|b| b.len()).sum()
    }

    /// Finalizes `Set-Cookie` headers for wire serialization (called by the
    /// HTTP/1 and HTTP/2 drivers before the codec chain runs).
    pub fn render_cookie_headers(&self) -> Vec<String> {
        self.cookies
            .iter()
            .map(|(name, value, flags)| encode_cookie(name, value, flags))
            .collect()
    }

    /// Applies the `Server:`/`Date:` ambient headers: `Date` is set from
    /// the ticker if absent, `Server` is set to `SERVER_TOKEN` when
    /// `send_server_token` is true.
    pub fn apply_ambient_headers(&mut self, http_date: &str, send_server_token: bool) {
        if !self.headers.contains("date") {
            self.headers.set("date", http_date);
        }
        if send_server_token && !self.headers.contains("server") {
            self.headers.set("server", SERVER_TOKEN);
        }
        for cookie in self.render_cookie_headers() {
            self.headers.append("set-cookie", cookie);
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_cookie(name: &str, value: &str, flags: &CookieFlags) -> String {
    let mut out = format!("{}={}", name, value);
    if let Some(domain) = &flags.domain {
        out.push_str("; domain="); out.push_str(domain);
    }
    if let Some(path) = &flags.path {
        out.push_str("; path="); out.push_str(path);
    }
    if let Some(max_age) = flags.max_age {
        out.push_str("; max-age="); out.push_str(&max_age.to_string());
        if flags.expires.is_none() {
            let expires_at = SystemTime::now() + Duration::from_secs(max_age);
            out.push_str("; expires=");
            out.push_str(&httpdate::fmt_http_date(expires_at));
        }
    }
    if let Some(expires) = &flags.expires {
        out.push_str("; expires="); out.push_str(expires);
    }
    if flags.secure {
        out.push_str("; secure");
    }
    if flags.http_only {
        out.push_str("; httponly");
    }
    if let Some(same_site) = &flags.same_site {
        out.push_str("; samesite="); out.push_str(same_site);
    }
    out
}

/// Renders the plain-HTML generic error body for a status code.
///
/// `json` selects a `{"error": "...", "status": N}` body instead, used by
/// the error taxonomy's `as_http` renderers in [`crate::errors`].
pub fn make_generic_body(status: StatusCode, version: Version, json: bool) -> Vec<u8> {
    let reason = status.default_reason();
    let code = status.code();
    if json {
        format!(r#"{{"error":"{reason}","status":{code}}}"#).into_bytes()
    } else {
        let body = format!(
            "<html><body><h1>{code} {reason}</h1></body></html>",
        );
        match version {
            Version::Http2 => body.into_bytes(),
            Version::Http11 | Version::Http10 => {
                let status_line = status.into_first_line(version);
                format!(
                    "{status_line}content-length: {}\r\ncontent-type: text/html\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                )
                .into_bytes()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_is_idempotent_with_empty_argument() {
        let mut resp = Response::new();
        resp.status(StatusCode::Ok).write(Bytes::from_static(b"a"));
        resp.end(None);
        resp.end(Some(Bytes::new()));
        assert_eq!(resp.body_len(), 1);
        assert!(resp.is_ended());
    }

    #[test]
    fn cookie_round_trip_synthesizes_expires_from_max_age() {
        let mut resp = Response::new();
        resp.set_cookie(
            "a",
            "b",
            CookieFlags {
                http_only: true,
                max_age: Some(60),
                ..Default::default()
            },
        );
        let rendered = resp.render_cookie_headers();
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].starts_with("a=b"));
        assert!(rendered[0].contains("max-age=60"));
        assert!(rendered[0].contains("httponly"));
        assert!(rendered[0].contains("expires="));
    }

    #[test]
    fn generic_body_contains_status_and_reason() {
        let body = make_generic_body(StatusCode::NotFound, Version::Http11, false);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("404 Not Found"));
        assert!(text.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn generic_body_json_variant() {
        let body = make_generic_body(StatusCode::InternalServerError, Version::Http2, true);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("\"status\":500"));
    }
}
