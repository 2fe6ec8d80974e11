//! Event-reconstruction pipeline.
//!
//! Raw hit lists flow through a fixed stage order, each stage narrowing
//! the set of competing interpretations of one physical event:
//!
//! ```text
//!  hit lists ──▶ Coincidence ──▶ Clusterizer ──▶ Tracker ──▶ CSR ──▶ Decay
//!                 (merge in       (merge          (find       (order   (tag
//!                  time window)    adjacent)       tracks)     sites)   lines)
//!                                      │
//!                                      ▼
//!                              RawEventAnalyzer
//!                     (selection filters, statistics, emit)
//! ```
//!
//! The orchestrator [`RawEventAnalyzer`] drives one event at a time
//! through the stages, applies the event-level selection windows, and
//! hands the winning interpretation to the configured sink, or records
//! why no interpretation survived.

pub mod analyzer;
pub mod clusterize;
pub mod coincidence;
pub mod config;
pub mod csr;
pub mod decay;
pub mod sink;
pub mod source;
pub mod stage;
pub mod statistics;
pub mod track;

pub use analyzer::{AnalysisStatus, RawEventAnalyzer};
pub use clusterize::Clusterizer;
pub use coincidence::Coincidence;
pub use config::ReconstructionConfig;
pub use csr::{CsrEngine, SequenceClassifier, SequenceFeatures};
pub use decay::DecayTagger;
pub use sink::{EventSink, JsonlSink, MemorySink};
pub use source::{EventStore, HitSource, VecSource};
pub use stage::ReconstructionStage;
pub use statistics::RunStatistics;
pub use track::Tracker;
