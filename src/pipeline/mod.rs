//! Pipeline stages for dossier-to-report generation.
//!
//! Each submodule implements exactly one step and returns a `Result`; the
//! runner sequences them, owns the job state and runs Cleanup. Keeping
//! stages separate makes each independently testable against fake models
//! and stores.
//!
//! ## Data Flow
//!
//! ```text
//! ingest ──▶ (OCR) ──▶ index ──▶ extract ──▶ consolidate ──▶ validate ──▶ cleanup
//! (upload)            (Pass 1)  (Pass 2)    (Pass 3)        (Pass 4)
//! ```
//!
//! 1. [`ingest`]: fetch, validate and upload the source into the job namespace
//! 2. [`index`]: propose candidate clusters; fixed-window fallback
//! 3. [`extract`]: one record per cluster on a bounded worker pool
//! 4. [`consolidate`]: merge records into the report, retried via [`retry`]
//! 5. [`validate`]: optional coverage addendum; never fails the job
//! 6. [`cleanup`]: best-effort deletion of everything the job created
//!
//! Shared helpers: [`llm`] (model calls with timeout and cancellation),
//! [`parse`] (per-stage output schemas) and [`postprocess`] (report cleanup).

pub mod cleanup;
pub mod consolidate;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod parse;
pub mod postprocess;
pub mod retry;
pub mod validate;
