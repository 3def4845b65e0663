//! Ordered middleware composition terminating at a responder.
//!
//! `middlewares[0]` wraps `middlewares[1]` wraps ... wraps the responder;
//! each stage may inspect/replace the `Response` produced by the next. The
//! chain is modeled as an explicit index into `InternalRequest` rather than
//! nested closures, so the index has somewhere to live across suspension
//! points and `submit()` can be a plain recursive call.

use crate::http::request::InternalRequest;
use crate::http::response::Response;
use async_trait::async_trait;
use std::sync::Arc;

/// One stage of the request pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: &mut InternalRequest, next: &Next) -> Response;
}

/// The remaining middleware stages plus the terminal responder, threaded
/// through `submit()` as each stage hands off to the next.
pub struct Next {
    stages: Arc<[Arc<dyn Middleware>]>,
    responder: Arc<dyn Responder>,
}

/// The terminal stage of a `RequestPipeline`.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: &mut InternalRequest) -> Response;
}

impl Next {
    pub fn new(stages: Arc<[Arc<dyn Middleware>]>, responder: Arc<dyn Responder>) -> Self {
        Self { stages, responder }
    }

    /// Invokes the next middleware in line, or the responder once the
    /// chain is exhausted.
    pub async fn submit(&self, request: &mut InternalRequest) -> Response {
        let index = request.middleware_index;
        match self.stages.get(index) {
            Some(stage) => {
                request.middleware_index += 1;
                let next = Next {
                    stages: self.stages.clone(),
                    responder: self.responder.clone(),
                };
                stage.handle(request, &next).await
            }
            None => self.responder.respond(request).await,
        }
    }
}

/// The ordered composition of middlewares, the terminal responder, and the
/// response filter chain for one request.
pub struct RequestPipeline {
    stages: Arc<[Arc<dyn Middleware>]>,
    responder: Arc<dyn Responder>,
}

impl RequestPipeline {
    pub fn new(stages: Vec<Arc<dyn Middleware>>, responder: Arc<dyn Responder>) -> Self {
        Self {
            stages: stages.into(),
            responder,
        }
    }

    /// Runs the full chain for one request, returning the canonical
    /// response the outermost stage produced.
    pub async fn run(&self, request: &mut InternalRequest) -> Response {
        request.middleware_index = 0;
        let next = Next::new(self.stages.clone(), self.responder.clone());
        next.submit(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::body::BodyEmitter;
    use crate::http::types::{HeaderMap, Method, StatusCode, Uri, Version};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_request() -> InternalRequest {
        let (_emitter, message) = BodyEmitter::new(4096, 4096);
        InternalRequest {
            method: Method::Get,
            uri: Uri::parse_origin_form("/").unwrap(),
            protocol: Version::Http11,
            headers: HeaderMap::new(),
            cookies: HashMap::new(),
            trace: crate::http::request::Trace::Http1(String::new()),
            stream_id: 0,
            time: 0,
            http_date: String::new(),
            max_body_size: 4096,
            body: message,
            middleware_index: 0,
            filter_error_flag: false,
            locals: Default::default(),
        }
    }

    struct CountingMiddleware(Arc<AtomicUsize>);
    #[async_trait]
    impl Middleware for CountingMiddleware {
        async fn handle(&self, request: &mut InternalRequest, next: &Next) -> Response {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.submit(request).await
        }
    }

    struct OkResponder;
    #[async_trait]
    impl Responder for OkResponder {
        async fn respond(&self, _request: &mut InternalRequest) -> Response {
            let mut response = Response::new();
            response.status(StatusCode::Ok);
            response
        }
    }

    #[tokio::test]
    async fn middlewares_run_in_order_before_responder() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pipeline = RequestPipeline::new(
            vec![
                Arc::new(CountingMiddleware(counter.clone())),
                Arc::new(CountingMiddleware(counter.clone())),
            ],
            Arc::new(OkResponder),
        );
        let mut request = sample_request();
        let response = pipeline.run(&mut request).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(response.status_code(), StatusCode::Ok);
    }
}
