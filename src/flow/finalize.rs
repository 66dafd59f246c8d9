use serde::Serialize;

use crate::flow::key::FlowKey;
use crate::flow::state::{ArrivalLog, FlowState, GapTotals};

/// Finished feature record of one flow. Field order is the column order of
/// the output table.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FeatureVector {
    #[serde(skip)]
    pub key: FlowKey,
    #[serde(rename = "Flow Duration")]
    pub flow_duration: f64,
    #[serde(rename = "Total Fwd Packets")]
    pub tot_fwd_pkts: u64,
    /// Forward payload bytes; the column name is kept for compatibility
    #[serde(rename = "Fwd Packets")]
    pub fwd_bytes: u64,
    #[serde(rename = "Bwd Packets")]
    pub bwd_bytes: u64,
    #[serde(rename = "Flow IAT")]
    pub flow_iat: f64,
    #[serde(rename = "SYN Flag Count")]
    pub syn_flag_cnt: u64,
    #[serde(rename = "FIN Flag Count")]
    pub fin_flag_cnt: u64,
    #[serde(rename = "Active Mean")]
    pub active_mean: f64,
    #[serde(rename = "Idle Mean")]
    pub idle_mean: f64,
    #[serde(rename = "Label")]
    pub label: String,
}

impl FeatureVector {
    pub const HEADERS: [&'static str; 10] = [
        "Flow Duration",
        "Total Fwd Packets",
        "Fwd Packets",
        "Bwd Packets",
        "Flow IAT",
        "SYN Flag Count",
        "FIN Flag Count",
        "Active Mean",
        "Idle Mean",
        "Label",
    ];
}

/// Splits successive arrival gaps at `active_threshold` and averages each
/// side. Gaps equal to the threshold count as idle. Fewer than two arrivals
/// give `(0.0, 0.0)`.
pub fn active_idle_means(timestamps: &[f64], active_threshold: f64) -> (f64, f64) {
    let mut totals = GapTotals::default();
    for window in timestamps.windows(2) {
        if let [prev, curr] = window {
            totals.add(curr - prev, active_threshold);
        }
    }
    (totals.active_mean(), totals.idle_mean())
}

/// Turns a flow's counters into its feature record. Takes the state by value:
/// once finalized a flow cannot be updated or finalized again.
pub fn finalize(state: FlowState, active_threshold: f64, label: &str) -> FeatureVector {
    let packets = state.packet_count();
    let (active_mean, idle_mean) = match &state.arrivals {
        ArrivalLog::Full(timestamps) => active_idle_means(timestamps, active_threshold),
        ArrivalLog::Streaming { totals, .. } => (totals.active_mean(), totals.idle_mean()),
    };
    let flow_iat = if packets > 0 {
        state.duration_micros / packets as f64
    } else {
        0.0
    };

    FeatureVector {
        key: state.key,
        flow_duration: state.duration_micros,
        tot_fwd_pkts: state.fwd_packet_count,
        fwd_bytes: state.fwd_byte_count,
        bwd_bytes: state.bwd_byte_count,
        flow_iat,
        syn_flag_cnt: state.syn_count,
        fin_flag_cnt: state.fin_count,
        active_mean,
        idle_mean,
        label: label.to_string(),
    }
}
