// THEORY:
// This file is the main entry point for the `synthscope` library crate, an
// engine that decides whether an image is camera-captured or synthetic.
//
// The public API is the `ForensicPipeline` (single-image analysis, feedback,
// retraining, model reload) and the `BatchExtractor` (resumable feature
// extraction over a labelled dataset). The detector battery, classifier and
// persistence layers live in `core_modules` and are exposed for callers that
// need to assemble their own stack, e.g. a custom detector registry.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod logging;
pub mod parallel_pipeline;
pub mod pipeline;

pub use config::Config;
pub use error::{Error, Result};
pub use parallel_pipeline::{BatchExtractor, BatchState, ExtractionOptions, ExtractionReport};
pub use pipeline::{AnalysisReport, FeedbackReceipt, ForensicPipeline, Label};
