//! HTTP/1.0 and HTTP/1.1 connection driver.

pub mod driver;

pub use driver::Http1Driver;
