//! Analysis Backend Integration
//!
//! Abstracted access to the analysis collaborator through a common trait.
//!
//! # Available Analyzers
//!
//! - **Ollama**: Local LLM server (default)
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{Analyzer, AnalyzerConfig, OllamaAnalyzer};
//!
//! let analyzer = OllamaAnalyzer::new(AnalyzerConfig::default());
//! let feedback = analyzer.analyze("Green buttons convert better").await?;
//! ```

mod ollama;
mod traits;

pub use ollama::{AnalyzerConfig, OllamaAnalyzer};
pub use traits::{fallback_analysis, Analyzer, AnalyzerError, AnalyzerFactory};
