//! HTTP receiver.
//!
//! Accepts notification payloads over HTTP (S3-compatible stores such as
//! MinIO deliver bucket notifications to webhook targets), plus health and
//! metrics endpoints.

pub mod handler;
