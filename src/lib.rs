//! Deal Valuation & Ecosystem Matching Engine
//!
//! Turns raw deal financials into auditable valuation reports and pairs
//! deals with ecosystem members:
//! - Normalizes heterogeneous financial input into snapshots
//! - Values deals by DCF, trading comparables and precedent transactions
//! - Flags leverage, growth, completeness and margin risks
//! - Embeds entities and ranks candidates by weighted compatibility
//! - Gates disclosure through a staged state machine
//! - Persists every derived artifact with supersession for audit
//!
//! FLOW:
//! RAW → NORMALIZE → (VALUATE ‖ ASSESS) → REPORT
//! PROFILE → EMBED → MATCH → DISCLOSE

pub mod api;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod matching;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod retry;
pub mod risk;
pub mod store;
pub mod valuation;

pub use error::{EngineError, Result};

// Re-export common types
pub use config::{EngineConfig, MatchWeights, Settings};
pub use models::*;
pub use orchestrator::{Collaborators, Orchestrator, ValuationOutcome, ValuationRequest};
