use std::collections::HashMap;

use log::debug;

use crate::config::Retention;
use crate::flow::key::{Direction, FlowKey};
use crate::flow::state::{ArrivalLog, FlowState};
use crate::packet::Packet;

/// Owns the live flow states, one per key.
pub struct FlowAccumulator {
    flows: HashMap<FlowKey, FlowState>,
    retention: Retention,
    active_threshold: f64,
    idle_timeout: Option<f64>,
}

impl FlowAccumulator {
    pub fn new(retention: Retention, active_threshold: f64, idle_timeout: Option<f64>) -> Self {
        Self {
            flows: HashMap::new(),
            retention,
            active_threshold,
            idle_timeout,
        }
    }

    /// Applies one packet to its flow, creating the flow on first sight.
    ///
    /// With an idle timeout, a packet arriving after the flow went quiet for
    /// longer than the timeout closes the old flow, which is returned, and
    /// opens a fresh one.
    pub fn update(&mut self, key: FlowKey, packet: &Packet, direction: Direction) -> Option<FlowState> {
        let idle_for = self.flows.get(&key).map(|state| packet.timestamp - state.last_seen);
        let expired = match (self.idle_timeout, idle_for) {
            (Some(timeout), Some(gap)) if gap > timeout => {
                debug!("flow {} idle for {:.3}s, restarting", key, gap);
                self.flows.remove(&key)
            }
            _ => None,
        };

        let (retention, threshold) = (self.retention, self.active_threshold);
        self.flows
            .entry(key)
            .or_insert_with_key(|key| FlowState::new(key.clone(), packet.index, ArrivalLog::new(retention, threshold)))
            .apply(packet, direction);
        expired
    }

    /// Removes every flow idle for longer than the timeout at `now`, oldest
    /// first. Does nothing without a timeout.
    pub fn expire_idle(&mut self, now: f64) -> Vec<FlowState> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };
        let stale: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, state)| now - state.last_seen > timeout)
            .map(|(key, _)| key.clone())
            .collect();
        let mut expired: Vec<FlowState> = stale.iter().filter_map(|key| self.flows.remove(key)).collect();
        expired.sort_by_key(|state| state.first_seen);
        expired
    }

    /// Removes every flow, ordered by the packet that opened it.
    pub fn drain(&mut self) -> Vec<FlowState> {
        let mut flows: Vec<FlowState> = self.flows.drain().map(|(_, state)| state).collect();
        flows.sort_by_key(|state| state.first_seen);
        flows
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowState> {
        self.flows.get(key)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyMode;
    use crate::flow::key::resolve;
    use crate::packet::fixtures::tcp_packet;

    fn feed(acc: &mut FlowAccumulator, packet: &Packet) -> Option<FlowState> {
        let (key, dir) = resolve(packet, KeyMode::AddressPair).unwrap();
        acc.update(key, packet, dir)
    }

    #[test]
    fn test_separate_flows() {
        let mut acc = FlowAccumulator::new(Retention::Full, 1.0, None);
        feed(&mut acc, &tcp_packet(1, 0.0, 0.0, "10.0.0.1", "10.0.0.2", 10, true, false));
        feed(&mut acc, &tcp_packet(2, 0.1, 0.1, "10.0.0.3", "10.0.0.4", 20, true, false));
        feed(&mut acc, &tcp_packet(3, 0.2, 0.1, "10.0.0.2", "10.0.0.1", 30, false, false));
        assert_eq!(acc.len(), 2);

        let flows = acc.drain();
        assert!(acc.is_empty());
        assert_eq!(flows[0].first_seen, 1);
        assert_eq!(flows[0].fwd_byte_count, 10);
        assert_eq!(flows[0].bwd_byte_count, 30);
        assert_eq!(flows[1].first_seen, 2);
        assert_eq!(flows[1].packet_count(), 1);
    }

    #[test]
    fn test_drain_in_first_seen_order() {
        let mut acc = FlowAccumulator::new(Retention::Full, 1.0, None);
        for i in 0..50u64 {
            let src = format!("10.1.{}.1", i);
            feed(&mut acc, &tcp_packet(i + 1, i as f64, 1.0, &src, "10.0.0.1", 1, false, false));
        }
        let order: Vec<u64> = acc.drain().iter().map(|s| s.first_seen).collect();
        assert_eq!(order, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn test_idle_timeout_restarts_flow() {
        let mut acc = FlowAccumulator::new(Retention::Full, 1.0, Some(5.0));
        assert!(feed(&mut acc, &tcp_packet(1, 0.0, 0.0, "10.0.0.1", "10.0.0.2", 1, true, false)).is_none());
        assert!(feed(&mut acc, &tcp_packet(2, 4.0, 4.0, "10.0.0.1", "10.0.0.2", 1, false, false)).is_none());

        let expired = feed(&mut acc, &tcp_packet(3, 10.0, 6.0, "10.0.0.1", "10.0.0.2", 1, false, false)).unwrap();
        assert_eq!(expired.packet_count(), 2);
        assert_eq!(expired.syn_count, 1);

        let fresh = acc.drain().pop().unwrap();
        assert_eq!(fresh.first_seen, 3);
        assert_eq!(fresh.packet_count(), 1);
    }

    #[test]
    fn test_expire_idle_sweep() {
        let mut acc = FlowAccumulator::new(Retention::Full, 1.0, Some(5.0));
        feed(&mut acc, &tcp_packet(1, 0.0, 0.0, "10.0.0.1", "10.0.0.2", 1, false, false));
        feed(&mut acc, &tcp_packet(2, 1.0, 1.0, "10.0.0.3", "10.0.0.4", 1, false, false));
        feed(&mut acc, &tcp_packet(3, 8.0, 7.0, "10.0.0.5", "10.0.0.6", 1, false, false));

        let expired = acc.expire_idle(6.5);
        assert_eq!(expired.iter().map(|s| s.first_seen).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_expire_without_timeout_is_noop() {
        let mut acc = FlowAccumulator::new(Retention::Full, 1.0, None);
        feed(&mut acc, &tcp_packet(1, 0.0, 0.0, "10.0.0.1", "10.0.0.2", 1, false, false));
        assert!(acc.expire_idle(1e9).is_empty());
        assert_eq!(acc.len(), 1);
    }
}
