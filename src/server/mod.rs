//! HTTP server implementation.
//!
//! `POST /api/run` executes one snippet; `GET /health` reports liveness.

mod handler;

pub use handler::{BODY_LIMIT_BYTES, RunRequest, RunResponse, respond, router, run, serve};
