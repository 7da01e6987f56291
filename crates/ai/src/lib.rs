//! `courier-ai`
//!
//! **Responsibility:** AI enrichment capability boundary.
//!
//! This crate never mutates messaging state:
//! - Analyzers turn message text into an [`Analysis`].
//! - Callers (infra workers) decide where the analysis is written.
//! - Failures are reported as [`AiError`]; callers degrade to a neutral result.

pub mod analyzer;
pub mod lexicon;
pub mod result;

pub use analyzer::{AnalysisContext, MessageAnalyzer, NeutralAnalyzer};
pub use lexicon::LexiconAnalyzer;
pub use result::{AiError, Analysis};
