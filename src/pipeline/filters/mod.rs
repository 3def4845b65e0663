//! Concrete codec filters.

pub mod chunked;
pub mod deflate;
pub mod null_body;
