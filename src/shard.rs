//! Multi-threaded accumulation. Flows never share state, so packets are
//! routed by key hash to worker threads that each own a disjoint shard.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use log::debug;

use crate::config::Retention;
use crate::error::{FlowError, Result};
use crate::flow::{Direction, FlowAccumulator, FlowKey, FlowState};
use crate::packet::Packet;

const SHARD_QUEUE_DEPTH: usize = 4096;

type Routed = (FlowKey, Packet, Direction);

pub struct ShardedAccumulator {
    senders: Vec<Sender<Routed>>,
    workers: Vec<JoinHandle<Vec<FlowState>>>,
}

impl ShardedAccumulator {
    pub fn spawn(shards: usize, retention: Retention, active_threshold: f64) -> Result<Self> {
        let shards = shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);

        for shard in 0..shards {
            let (tx, rx) = bounded::<Routed>(SHARD_QUEUE_DEPTH);
            let handle = thread::Builder::new()
                .name(format!("flow-shard-{}", shard))
                .spawn(move || {
                    let mut accumulator = FlowAccumulator::new(retention, active_threshold, None);
                    for (key, packet, direction) in rx.iter() {
                        accumulator.update(key, &packet, direction);
                    }
                    debug!("shard {} done: {} flows", shard, accumulator.len());
                    accumulator.drain()
                })?;
            senders.push(tx);
            workers.push(handle);
        }
        Ok(Self { senders, workers })
    }

    /// Shards whose workers are already gone, so every update fails.
    #[cfg(test)]
    pub(crate) fn disconnected(shards: usize) -> Self {
        let senders = (0..shards.max(1)).map(|_| bounded::<Routed>(1).0).collect();
        Self {
            senders,
            workers: Vec::new(),
        }
    }

    pub fn shards(&self) -> usize {
        self.senders.len()
    }

    fn shard_of(&self, key: &FlowKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    pub fn update(&self, key: FlowKey, packet: Packet, direction: Direction) -> Result<()> {
        let shard = self.shard_of(&key);
        self.senders[shard]
            .send((key, packet, direction))
            .map_err(|_| FlowError::WorkerError(format!("shard {} stopped accepting packets", shard)))
    }

    /// Closes the shards and collects every flow, ordered by the packet that
    /// opened it.
    pub fn finish(self) -> Result<Vec<FlowState>> {
        drop(self.senders);
        let mut flows = Vec::new();
        for (shard, handle) in self.workers.into_iter().enumerate() {
            let closed = handle
                .join()
                .map_err(|_| FlowError::WorkerError(format!("shard {} panicked", shard)))?;
            flows.extend(closed);
        }
        flows.sort_by_key(|state| state.first_seen);
        Ok(flows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyMode;
    use crate::flow::resolve;
    use crate::packet::fixtures::tcp_packet;

    fn packets() -> Vec<Packet> {
        (0..400u64)
            .map(|i| {
                let src = format!("10.0.{}.{}", i % 7, i % 3);
                let dst = format!("10.9.{}.1", i % 5);
                let (src, dst) = if i % 2 == 0 { (src, dst) } else { (dst, src) };
                tcp_packet(i + 1, i as f64 * 0.3, 0.3, &src, &dst, i % 50, i % 11 == 0, i % 13 == 0)
            })
            .collect()
    }

    #[test]
    fn test_sharded_matches_sequential() {
        let mut sequential = FlowAccumulator::new(Retention::Full, 1.0, None);
        let sharded = ShardedAccumulator::spawn(4, Retention::Full, 1.0).unwrap();
        assert_eq!(sharded.shards(), 4);

        for packet in packets() {
            let (key, dir) = resolve(&packet, KeyMode::AddressPair).unwrap();
            sequential.update(key.clone(), &packet, dir);
            sharded.update(key, packet, dir).unwrap();
        }

        let expected = sequential.drain();
        let actual = sharded.finish().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_single_shard_and_empty_run() {
        let sharded = ShardedAccumulator::spawn(0, Retention::Streaming, 1.0).unwrap();
        assert_eq!(sharded.shards(), 1);
        assert!(sharded.finish().unwrap().is_empty());
    }

    #[test]
    fn test_update_after_worker_exit_fails() {
        let sharded = ShardedAccumulator::disconnected(2);
        let packet = tcp_packet(1, 0.0, 0.0, "10.0.0.1", "10.0.0.2", 1, false, false);
        let (key, dir) = resolve(&packet, KeyMode::AddressPair).unwrap();
        assert!(matches!(sharded.update(key, packet, dir), Err(FlowError::WorkerError(_))));
    }
}
