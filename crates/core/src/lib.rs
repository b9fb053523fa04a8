pub mod config;
pub mod request;
pub mod spec_decode;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
