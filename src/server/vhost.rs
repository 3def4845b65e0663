//! Host-based request-pipeline dispatch.
//!
//! SNI selection happens above this crate — consuming a pre-negotiated
//! encrypted byte stream is out of scope here — so this container
//! only implements the `Host:` (HTTP/1) / `:authority` (HTTP/2) half of the
//! lookup, keyed off `InternalRequest.uri.host`.

use crate::pipeline::RequestPipeline;
use std::sync::Arc;

/// Maps request hosts to the pipeline that should handle them. Exact names
/// win; `*.suffix` entries match any host ending in `.suffix`; anything else
/// falls back to the default pipeline.
pub struct VhostContainer {
    entries: Vec<(String, Arc<RequestPipeline>)>,
    default: Arc<RequestPipeline>,
}

impl VhostContainer {
    pub fn new(default: Arc<RequestPipeline>) -> Self {
        Self { entries: Vec::new(), default }
    }

    /// Binds a pipeline to a host name, or a `*.suffix` wildcard.
    pub fn bind(&mut self, host: impl Into<String>, pipeline: Arc<RequestPipeline>) {
        self.entries.push((host.into().to_ascii_lowercase(), pipeline));
    }

    pub fn resolve(&self, host_header: Option<&str>) -> &Arc<RequestPipeline> {
        let Some(host) = host_header else {
            return &self.default;
        };
        let host = strip_port(host).to_ascii_lowercase();
        for (pattern, pipeline) in &self.entries {
            if pattern == &host {
                return pipeline;
            }
            if let Some(suffix) = pattern.strip_prefix("*.") {
                if host.len() > suffix.len() && host.ends_with(suffix) {
                    return pipeline;
                }
            }
        }
        &self.default
    }
}

fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::InternalRequest;
    use crate::http::response::Response;
    use crate::http::types::StatusCode;
    use crate::pipeline::{RequestPipeline, Responder};
    use async_trait::async_trait;

    struct EmptyResponder;
    #[async_trait]
    impl Responder for EmptyResponder {
        async fn respond(&self, _request: &mut InternalRequest) -> Response {
            let mut response = Response::new();
            response.status(StatusCode::Ok);
            response
        }
    }

    fn pipeline() -> Arc<RequestPipeline> {
        Arc::new(RequestPipeline::new(Vec::new(), Arc::new(EmptyResponder)))
    }

    #[test]
    fn falls_back_to_default_with_no_host() {
        let container = VhostContainer::new(pipeline());
        assert!(Arc::ptr_eq(container.resolve(None), &container.default));
    }

    #[test]
    fn exact_match_wins_over_wildcard() {
        let mut container = VhostContainer::new(pipeline());
        let wildcard = pipeline();
        let exact = pipeline();
        container.bind("*.example.com", wildcard.clone());
        container.bind("api.example.com", exact.clone());

        assert!(Arc::ptr_eq(container.resolve(Some("api.example.com:443")), &exact));
        assert!(Arc::ptr_eq(container.resolve(Some("static.example.com")), &wildcard));
        assert!(Arc::ptr_eq(container.resolve(Some("unrelated.test")), &container.default));
    }
}
