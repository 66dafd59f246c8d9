//! Pipeline driver: pulls frames in capture order, routes classifiable
//! packets into their flows and emits one feature record per flow.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::capture::PacketSource;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::flow::{finalize, resolve, Direction, FeatureVector, FlowAccumulator, FlowKey, FlowState};
use crate::packet::{normalize_with, Packet};
use crate::shard::ShardedAccumulator;
use crate::sink::FeatureSink;

/// Counters of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub packets_seen: u64,
    pub packets_classified: u64,
    /// Packets without a network or transport layer
    pub packets_skipped: u64,
    pub flows_emitted: u64,
    /// Ended by the stop flag or the packet limit rather than exhaustion
    pub stopped_early: bool,
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
}

fn format_ts(ts: Option<f64>) -> String {
    ts.and_then(|t| {
        let secs = t.floor();
        DateTime::<Utc>::from_timestamp(secs as i64, ((t - secs) * 1e9) as u32)
    })
    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
    .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets ({} in flows, {} skipped), {} flows emitted, capture {} .. {}{}",
            self.packets_seen,
            self.packets_classified,
            self.packets_skipped,
            self.flows_emitted,
            format_ts(self.first_timestamp),
            format_ts(self.last_timestamp),
            if self.stopped_early { " (stopped early)" } else { "" }
        )
    }
}

enum Engine {
    Sequential(FlowAccumulator),
    Sharded(ShardedAccumulator),
}

impl Engine {
    fn update(&mut self, key: FlowKey, packet: Packet, direction: Direction) -> Result<Option<FlowState>> {
        match self {
            Engine::Sequential(acc) => Ok(acc.update(key, &packet, direction)),
            Engine::Sharded(acc) => acc.update(key, packet, direction).map(|_| None),
        }
    }

    /// Idle timeouts only run on the sequential engine; `validate` rejects
    /// them together with more than one worker.
    fn expire_idle(&mut self, now: f64) -> Vec<FlowState> {
        match self {
            Engine::Sequential(acc) => acc.expire_idle(now),
            Engine::Sharded(_) => Vec::new(),
        }
    }

    fn finish(self) -> Result<Vec<FlowState>> {
        match self {
            Engine::Sequential(mut acc) => Ok(acc.drain()),
            Engine::Sharded(acc) => acc.finish(),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends the run at the next frame boundary when set. Flows
    /// tracked at that point are still finalized and emitted.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn start_engine(&self) -> Result<Engine> {
        let c = &self.config;
        let workers = c.effective_workers();
        if workers > 1 {
            info!("Accumulating flows on {} worker threads", workers);
            Ok(Engine::Sharded(ShardedAccumulator::spawn(workers, c.retention, c.active_threshold_secs)?))
        } else {
            Ok(Engine::Sequential(FlowAccumulator::new(
                c.retention,
                c.active_threshold_secs,
                c.idle_timeout_secs,
            )))
        }
    }

    fn emit(&self, state: FlowState, sink: &mut dyn FeatureSink, summary: &mut RunSummary) -> Result<()> {
        debug!("flow {} closed after {} packets", state.key, state.packet_count());
        let record = finalize(state, self.config.active_threshold_secs, &self.config.label);
        sink.write(&record)?;
        summary.flows_emitted += 1;
        Ok(())
    }

    pub fn run(&self, source: &mut dyn PacketSource, sink: &mut dyn FeatureSink) -> Result<RunSummary> {
        self.config.validate()?;
        let engine = self.start_engine()?;
        self.run_engine(engine, source, sink)
    }

    fn run_engine(
        &self,
        mut engine: Engine,
        source: &mut dyn PacketSource,
        sink: &mut dyn FeatureSink,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let remaining = match self
            .pump(&mut engine, source, sink, &mut summary)
            .and_then(|()| engine.finish())
        {
            Ok(remaining) => remaining,
            Err(e) => {
                error!("Run failed after {} packets: {}", summary.packets_seen, e);
                // keep what was already emitted, drop unfinished flows
                if let Err(flush_err) = sink.flush() {
                    warn!("Flushing output after failure: {}", flush_err);
                }
                return Err(e);
            }
        };

        let threshold = self.config.active_threshold_secs;
        let label = self.config.label.as_str();
        let records: Vec<FeatureVector> = remaining
            .into_par_iter()
            .map(|state| finalize(state, threshold, label))
            .collect();
        for record in &records {
            sink.write(record)?;
        }
        summary.flows_emitted += records.len() as u64;
        sink.flush()?;

        info!("{}", summary);
        Ok(summary)
    }

    /// Feeds frames into the engine until the source ends or the run is
    /// stopped. Flows closed by the idle timeout are emitted on the way.
    fn pump(
        &self,
        engine: &mut Engine,
        source: &mut dyn PacketSource,
        sink: &mut dyn FeatureSink,
        summary: &mut RunSummary,
    ) -> Result<()> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop requested after {} packets, finalizing tracked flows", summary.packets_seen);
                summary.stopped_early = true;
                return Ok(());
            }
            if let Some(limit) = self.config.max_packets {
                if summary.packets_seen >= limit {
                    info!("Reached packet limit of {}, finalizing tracked flows", limit);
                    summary.stopped_early = true;
                    return Ok(());
                }
            }

            let Some(frame) = source.next_frame()? else {
                return Ok(());
            };

            let packet = normalize_with(&frame, self.config.include_udp);
            let now = packet.timestamp;
            summary.packets_seen += 1;
            summary.first_timestamp.get_or_insert(now);
            summary.last_timestamp = Some(now);
            if summary.packets_seen % self.config.progress_interval == 0 {
                info!("Processed {} packets", summary.packets_seen);
            }

            match resolve(&packet, self.config.key_mode) {
                Some((key, direction)) => {
                    summary.packets_classified += 1;
                    if let Some(expired) = engine.update(key, packet, direction)? {
                        self.emit(expired, sink, summary)?;
                    }
                }
                None => {
                    summary.packets_skipped += 1;
                    debug!("packet {} has no network/transport layer, not in any flow", packet.index);
                }
            }

            if self.config.idle_timeout_secs.is_some() && summary.packets_seen % self.config.progress_interval == 0 {
                for state in engine.expire_idle(now) {
                    self.emit(state, sink, summary)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameList, LinkLayer, RawFrame};
    use crate::config::{KeyMode, Retention};
    use crate::error::FlowError;
    use crate::packet::fixtures::{arp_frame, ipv4_tcp_frame, ipv4_udp_frame};
    use crate::sink::CollectingSink;
    use pnet::packet::tcp::TcpFlags;

    const A: [u8; 4] = [10, 0, 0, 1];
    const B: [u8; 4] = [10, 0, 0, 2];
    const C: [u8; 4] = [10, 0, 0, 3];

    fn run(config: PipelineConfig, frames: Vec<(f64, LinkLayer, Vec<u8>)>) -> (RunSummary, CollectingSink) {
        let mut source = FrameList::new(frames);
        let mut sink = CollectingSink::default();
        let summary = Pipeline::new(config).run(&mut source, &mut sink).unwrap();
        (summary, sink)
    }

    fn eth(ts: f64, data: Vec<u8>) -> (f64, LinkLayer, Vec<u8>) {
        (ts, LinkLayer::Ethernet, data)
    }

    fn mixed_capture() -> Vec<(f64, LinkLayer, Vec<u8>)> {
        vec![
            eth(0.0, ipv4_tcp_frame(A, B, 40000, 80, TcpFlags::SYN, 0)),
            eth(0.1, arp_frame()),
            eth(0.2, ipv4_tcp_frame(C, A, 5353, 22, TcpFlags::SYN, 10)),
            eth(0.3, ipv4_tcp_frame(B, A, 80, 40000, TcpFlags::SYN | TcpFlags::ACK, 0)),
            eth(0.4, ipv4_udp_frame(A, B, 53000, 53, 30)),
            eth(2.0, ipv4_tcp_frame(A, B, 40000, 80, TcpFlags::FIN, 5)),
        ]
    }

    #[test]
    fn test_flows_emitted_in_first_seen_order() {
        let (summary, sink) = run(PipelineConfig::default(), mixed_capture());
        assert_eq!(summary.packets_seen, 6);
        assert_eq!(summary.packets_classified, 4);
        // ARP frame and UDP datagram
        assert_eq!(summary.packets_skipped, 2);
        assert_eq!(summary.flows_emitted, 2);
        assert!(!summary.stopped_early);
        assert_eq!(sink.flushes, 1);

        let tcp_ab = &sink.records[0];
        assert_eq!(tcp_ab.tot_fwd_pkts, 2);
        assert_eq!(tcp_ab.fwd_bytes, 5);
        assert_eq!(tcp_ab.syn_flag_cnt, 2);
        assert_eq!(tcp_ab.fin_flag_cnt, 1);
        assert!((tcp_ab.idle_mean - 1.7).abs() < 1e-9);
        assert!((tcp_ab.active_mean - 0.3).abs() < 1e-9);

        let tcp_ca = &sink.records[1];
        assert_eq!(tcp_ca.tot_fwd_pkts, 0);
        assert_eq!(tcp_ca.bwd_bytes, 10);
    }

    #[test]
    fn test_udp_flows_when_included() {
        let config = PipelineConfig {
            include_udp: true,
            ..PipelineConfig::default()
        };
        let (summary, sink) = run(config, mixed_capture());
        assert_eq!(summary.packets_classified, 5);
        assert_eq!(summary.packets_skipped, 1);
        assert_eq!(sink.records.len(), 3);

        let udp = &sink.records[2];
        assert_eq!(udp.fwd_bytes, 30);
        assert_eq!(udp.syn_flag_cnt, 0);
    }

    #[test]
    fn test_single_flow_mode_aggregates_everything() {
        let config = PipelineConfig {
            key_mode: KeyMode::SingleFlow,
            ..PipelineConfig::default()
        };
        let (_, sink) = run(config, mixed_capture());
        assert_eq!(sink.records.len(), 1);
        assert_eq!(sink.records[0].key, FlowKey::Capture);
        assert_eq!(sink.records[0].syn_flag_cnt, 3);
    }

    #[test]
    fn test_max_packets_still_finalizes() {
        let config = PipelineConfig {
            max_packets: Some(3),
            ..PipelineConfig::default()
        };
        let (summary, sink) = run(config, mixed_capture());
        assert!(summary.stopped_early);
        assert_eq!(summary.packets_seen, 3);
        assert_eq!(sink.records.len(), 2);
    }

    #[test]
    fn test_stop_flag_before_start() {
        let pipeline = Pipeline::new(PipelineConfig::default());
        pipeline.stop_handle().store(true, Ordering::SeqCst);
        let mut sink = CollectingSink::default();
        let summary = pipeline.run(&mut FrameList::new(mixed_capture()), &mut sink).unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.packets_seen, 0);
        assert!(sink.records.is_empty());
        assert_eq!(sink.flushes, 1);
    }

    struct FailingSource {
        frames: FrameList,
        fail_after: u64,
        served: u64,
    }

    impl PacketSource for FailingSource {
        fn next_frame(&mut self) -> Result<Option<RawFrame>> {
            if self.served == self.fail_after {
                return Err(FlowError::IoError("disk went away".into()));
            }
            self.served += 1;
            self.frames.next_frame()
        }
    }

    #[test]
    fn test_source_failure_is_fatal_and_flushes() {
        let config = PipelineConfig {
            idle_timeout_secs: Some(1.0),
            progress_interval: 1,
            ..PipelineConfig::default()
        };
        let mut source = FailingSource {
            frames: FrameList::new(vec![
                eth(0.0, ipv4_tcp_frame(A, B, 1, 2, TcpFlags::SYN, 0)),
                eth(5.0, ipv4_tcp_frame(C, B, 1, 2, TcpFlags::SYN, 0)),
                eth(5.1, ipv4_tcp_frame(C, B, 1, 2, 0, 0)),
            ]),
            fail_after: 3,
            served: 0,
        };
        let mut sink = CollectingSink::default();
        let result = Pipeline::new(config).run(&mut source, &mut sink);

        assert!(matches!(result, Err(FlowError::IoError(_))));
        // the A-B flow expired before the failure, the C-B flow was never finished
        assert_eq!(sink.records.len(), 1);
        assert_eq!(sink.records[0].syn_flag_cnt, 1);
        assert_eq!(sink.flushes, 1);
    }

    #[test]
    fn test_worker_failure_is_fatal_and_flushes() {
        let pipeline = Pipeline::new(PipelineConfig::default());
        let engine = Engine::Sharded(ShardedAccumulator::disconnected(2));
        let mut sink = CollectingSink::default();
        let result = pipeline.run_engine(engine, &mut FrameList::new(mixed_capture()), &mut sink);

        assert!(matches!(result, Err(FlowError::WorkerError(_))));
        assert!(sink.records.is_empty());
        assert_eq!(sink.flushes, 1);
    }

    #[test]
    fn test_idle_sweep_emits_expired_flows_first() {
        let config = PipelineConfig {
            idle_timeout_secs: Some(10.0),
            progress_interval: 2,
            ..PipelineConfig::default()
        };
        let (summary, sink) = run(
            config,
            vec![
                eth(0.0, ipv4_tcp_frame(A, B, 1, 2, 0, 1)),
                eth(1.0, ipv4_tcp_frame(A, C, 1, 2, 0, 2)),
                eth(20.0, ipv4_tcp_frame(B, C, 1, 2, 0, 3)),
                eth(21.0, ipv4_tcp_frame(B, C, 1, 2, 0, 4)),
            ],
        );
        assert_eq!(summary.flows_emitted, 3);
        let bytes: Vec<u64> = sink.records.iter().map(|r| r.fwd_bytes).collect();
        assert_eq!(bytes, vec![1, 2, 7]);
    }

    #[test]
    fn test_sharded_run_matches_sequential() {
        let frames: Vec<_> = (0..300u32)
            .map(|i| {
                let src = [10, 0, (i % 9) as u8, 1];
                let dst = [10, 1, (i % 4) as u8, 1];
                let (s, d) = if i % 2 == 0 { (src, dst) } else { (dst, src) };
                eth(i as f64 * 0.45, ipv4_tcp_frame(s, d, 1000, 80, if i % 17 == 0 { TcpFlags::SYN } else { 0 }, (i % 40) as usize))
            })
            .collect();

        let (seq_summary, seq) = run(PipelineConfig::default(), frames.clone());
        let sharded_config = PipelineConfig {
            workers: 3,
            retention: Retention::Streaming,
            ..PipelineConfig::default()
        };
        let (par_summary, par) = run(sharded_config, frames);

        assert_eq!(seq_summary.flows_emitted, par_summary.flows_emitted);
        assert_eq!(seq.records, par.records);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PipelineConfig {
            progress_interval: 0,
            ..PipelineConfig::default()
        };
        let mut sink = CollectingSink::default();
        let result = Pipeline::new(config).run(&mut FrameList::new(vec![]), &mut sink);
        assert!(matches!(result, Err(FlowError::ConfigError(_))));
    }

    #[test]
    fn test_summary_display() {
        let summary = RunSummary {
            packets_seen: 3,
            packets_classified: 2,
            packets_skipped: 1,
            flows_emitted: 1,
            stopped_early: false,
            first_timestamp: Some(0.0),
            last_timestamp: Some(1.5),
        };
        assert_eq!(
            summary.to_string(),
            "3 packets (2 in flows, 1 skipped), 1 flows emitted, capture 1970-01-01 00:00:00.000000 .. 1970-01-01 00:00:01.500000"
        );
    }
}
