//! Packet capture to per-flow feature records.
//!
//! Frames from a [`capture::PacketSource`] are normalized into [`packet::Packet`]s,
//! grouped into bidirectional flows by [`flow::resolve`], accumulated, and
//! finalized into one [`flow::FeatureVector`] per flow for a [`sink::FeatureSink`].

pub mod capture;
pub mod config;
pub mod error;
pub mod flow;
pub mod packet;
pub mod pipeline;
pub mod shard;
pub mod sink;

pub use config::{KeyMode, PipelineConfig, Retention};
pub use error::{FlowError, Result};
pub use flow::FeatureVector;
pub use pipeline::{Pipeline, RunSummary};
