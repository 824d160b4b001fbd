//! platemark turns queued PDF render jobs into watermarked page-image
//! artifacts (lossless WEBP).
//!
//! The worker consumes job envelopes from a Redis list, rasterizes the first
//! page of the referenced document through a fallback chain of external
//! engines, composites an optional tiled text watermark, encodes the result,
//! and publishes it both into a content-addressed cache and under a
//! job-addressable output name. Job lifecycle is tracked in a per-job status
//! record that only ever moves forward: queued → processing → done | error.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
