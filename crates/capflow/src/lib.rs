// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # CapFlow
//!
//! Agent-facing tool and capability discovery: a recursive superhypergraph
//! over atomic tools and learned multi-tool capabilities, ranked by a
//! multi-head graph-attention scorer trained from execution traces with
//! prioritized experience replay, backed by a hybrid semantic+structural
//! search fabric with locally adaptive weighting and a well-defined
//! degradation chain (SHGAT -> hybrid -> semantic-only -> keyword).
//!
//! ## Architecture
//!
//! - [`graph`] owns tools and capabilities and the four edge kinds;
//!   readers see atomic [`graph::GraphSnapshot`]s.
//! - [`index`] serves cosine top-K over L2-normalized embeddings.
//! - [`spectral`] clusters the quasi-bipartite structure and computes
//!   hypergraph PageRank, behind a TTL cache.
//! - [`alpha`] weighs semantic against structural evidence per target.
//! - [`replay`] stores execution traces and samples them by priority.
//! - [`shgat`] is the attention scorer and its trainer.
//! - [`worker`] talks to the out-of-process training worker.
//! - [`sync`] is the single graph writer, fed from storage.
//! - [`discovery`] composes everything behind the fallback chain.
//! - [`rationale`] derives confidences and explanations.
//!
//! ## Example
//!
//! ```rust,ignore
//! use capflow::prelude::*;
//!
//! let config = CapflowConfig::default();
//! let model = Arc::new(ShgatModel::new(&config, 0)?);
//! let orchestrator = DiscoveryOrchestrator::builder(/* shared state */)
//!     .with_model(model)
//!     .with_embedder(embedder)
//!     .build()?;
//! let tools = orchestrator
//!     .discover_tools("fetch recent users", 10, 0.0, &[], DiscoveryMode::ActiveSearch)
//!     .await?;
//! ```

pub mod alpha;
pub mod capability;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod embeddings;
pub mod error;
pub mod graph;
pub mod index;
pub mod rationale;
pub mod replay;
pub mod shgat;
pub mod spectral;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod tensor;
pub mod trace;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod test_support;

pub use crate::capability::{
    Capability, CapabilitySource, Fqdn, GraphFeatures, Member, StaticStructure, Tool,
};
pub use crate::config::CapflowConfig;
pub use crate::discovery::{
    CalledCapability, CapabilityDiscovery, DiscoveryOrchestrator, ToolDiscovery,
};
pub use crate::error::{CapflowError, Result};
pub use crate::shgat::{ShgatModel, ShgatParams, TrainingState};
pub use crate::trace::{DecisionRecord, DiscoveryMode, ExecutionTrace};

/// Commonly used types, one import away.
pub mod prelude {
    pub use crate::alpha::{AlphaCalculator, LocalAlpha};
    pub use crate::capability::{Capability, Fqdn, Member, Tool};
    pub use crate::config::CapflowConfig;
    pub use crate::discovery::{CapabilityDiscovery, DiscoveryOrchestrator, ToolDiscovery};
    pub use crate::embeddings::Embedder;
    pub use crate::error::{CapflowError, Result};
    pub use crate::graph::{EdgeKind, EdgeSource, GraphSnapshot, ToolGraph};
    pub use crate::index::VectorIndex;
    pub use crate::replay::TraceStore;
    pub use crate::shgat::{ShgatModel, ShgatParams, TrainingState};
    pub use crate::spectral::SpectralManager;
    pub use crate::storage::{CapabilityRegistry, Storage, ToolRepository};
    pub use crate::sync::GraphSyncController;
    pub use crate::trace::{DiscoveryMode, ExecutionTrace};
    pub use std::sync::Arc;
}
