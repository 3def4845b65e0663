//! The response pipeline: middleware composition plus the response codec
//!.

pub mod codec;
pub mod filters;
pub mod middleware;

pub use codec::{CodecChain, Filter, Frame};
pub use middleware::{Middleware, Next, RequestPipeline, Responder};
