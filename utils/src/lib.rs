//! Helpers shared by the privcam example programs and integration tests.
pub mod dmabuf_exporter;
pub mod framegen;
