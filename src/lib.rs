//! Real-time cross-venue arbitrage engine for DEX markets.
//!
//! Price quotes fan in from heterogeneous sources (on-chain oracles, HTTP
//! aggregator APIs, exchange streams, the mempool), get aggregated with
//! outlier rejection and confidence weighting, and flow as candidate
//! opportunities through a multi-stage pipeline that validates, scores,
//! risk-checks, and releases them to an external executor. A layered safety
//! plane (circuit breakers, emergency stop, incident response) gates every
//! execution path.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod feeds;
pub mod handlers;
pub mod mempool;
pub mod metrics;
pub mod pipeline;
pub mod router;
pub mod safety;
pub mod transport;
pub mod types;

pub use aggregator::PriceAggregator;
pub use cache::CacheManager;
pub use config::EngineConfig;
pub use engine::{Engine, EngineState, EngineStatus};
pub use error::EngineError;
pub use feeds::{PriceOracleManager, PriceSource};
pub use mempool::EventListenerManager;
pub use pipeline::{Executor, OpportunityPipeline, RiskAssessor};
pub use router::DataRouter;
pub use safety::{AlertSink, SafetyPlane};
pub use transport::WebSocketManager;
pub use types::{AggregatedPrice, Opportunity, OpportunityKind, PricePoint, TradingGate};
