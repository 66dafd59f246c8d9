use crate::config::Retention;
use crate::flow::key::{Direction, FlowKey};
use crate::packet::Packet;

/// Running active/idle totals, for flows that must not keep every timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GapTotals {
    pub active_sum: f64,
    pub active_count: u64,
    pub idle_sum: f64,
    pub idle_count: u64,
}

impl GapTotals {
    pub fn add(&mut self, gap: f64, active_threshold: f64) {
        if gap < active_threshold {
            self.active_sum += gap;
            self.active_count += 1;
        } else {
            self.idle_sum += gap;
            self.idle_count += 1;
        }
    }

    pub fn active_mean(&self) -> f64 {
        mean(self.active_sum, self.active_count)
    }

    pub fn idle_mean(&self) -> f64 {
        mean(self.idle_sum, self.idle_count)
    }
}

fn mean(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Arrival history of a flow.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrivalLog {
    /// Every arrival time, in arrival order
    Full(Vec<f64>),
    Streaming {
        last: Option<f64>,
        arrivals: u64,
        totals: GapTotals,
        active_threshold: f64,
    },
}

impl ArrivalLog {
    pub fn new(retention: Retention, active_threshold: f64) -> Self {
        match retention {
            Retention::Full => ArrivalLog::Full(Vec::new()),
            Retention::Streaming => ArrivalLog::Streaming {
                last: None,
                arrivals: 0,
                totals: GapTotals::default(),
                active_threshold,
            },
        }
    }

    pub fn push(&mut self, timestamp: f64) {
        match self {
            ArrivalLog::Full(timestamps) => timestamps.push(timestamp),
            ArrivalLog::Streaming {
                last,
                arrivals,
                totals,
                active_threshold,
            } => {
                if let Some(prev) = *last {
                    totals.add(timestamp - prev, *active_threshold);
                }
                *last = Some(timestamp);
                *arrivals += 1;
            }
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            ArrivalLog::Full(timestamps) => timestamps.len() as u64,
            ArrivalLog::Streaming { arrivals, .. } => *arrivals,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Running counters of one flow. Counters only grow until the state is
/// handed to the finalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowState {
    pub key: FlowKey,
    /// Capture index of the packet that opened the flow
    pub first_seen: u64,
    /// Timestamp of the most recent packet
    pub last_seen: f64,
    pub duration_micros: f64,
    pub fwd_packet_count: u64,
    pub bwd_packet_count: u64,
    pub fwd_byte_count: u64,
    pub bwd_byte_count: u64,
    pub syn_count: u64,
    pub fin_count: u64,
    pub arrivals: ArrivalLog,
}

impl FlowState {
    pub fn new(key: FlowKey, first_seen: u64, arrivals: ArrivalLog) -> Self {
        Self {
            key,
            first_seen,
            last_seen: f64::NEG_INFINITY,
            duration_micros: 0.0,
            fwd_packet_count: 0,
            bwd_packet_count: 0,
            fwd_byte_count: 0,
            bwd_byte_count: 0,
            syn_count: 0,
            fin_count: 0,
            arrivals,
        }
    }

    /// Folds one packet into the counters.
    pub fn apply(&mut self, packet: &Packet, direction: Direction) {
        self.duration_micros += packet.inter_arrival_delta * 1e6;
        match direction {
            Direction::Forward => {
                self.fwd_packet_count += 1;
                self.fwd_byte_count += packet.transport_len();
            }
            Direction::Backward => {
                self.bwd_packet_count += 1;
                self.bwd_byte_count += packet.transport_len();
            }
        }
        if packet.syn_flag() {
            self.syn_count += 1;
        }
        if packet.fin_flag() {
            self.fin_count += 1;
        }
        self.arrivals.push(packet.timestamp);
        self.last_seen = self.last_seen.max(packet.timestamp);
    }

    pub fn packet_count(&self) -> u64 {
        self.fwd_packet_count + self.bwd_packet_count
    }
}
