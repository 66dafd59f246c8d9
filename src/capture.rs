//! Capture sources. A source hands the pipeline raw frames in capture order;
//! decoding them is the normalizer's job.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::{debug, info, warn};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{Block, Linktype, PcapBlockOwned, PcapError};

use crate::error::{FlowError, Result};

const READER_CAPACITY: usize = 1 << 20;

/// Link-layer framing of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Bare IPv4 or IPv6 packet, version taken from the first nibble
    RawIp,
    /// BSD loopback: 4-byte address family header
    Null,
    /// Linux cooked capture v1: 16-byte header
    LinuxSll,
    Unsupported(i32),
}

impl From<Linktype> for LinkLayer {
    fn from(linktype: Linktype) -> Self {
        match linktype {
            Linktype::ETHERNET => LinkLayer::Ethernet,
            Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => LinkLayer::RawIp,
            Linktype::NULL | Linktype::LOOP => LinkLayer::Null,
            Linktype::LINUX_SLL => LinkLayer::LinuxSll,
            Linktype(other) => LinkLayer::Unsupported(other),
        }
    }
}

/// One captured frame, still undecoded.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// 1-based position in the capture
    pub number: u64,
    /// Seconds since the epoch
    pub timestamp: f64,
    /// Seconds since the previous frame; 0 for the first
    pub time_delta: f64,
    pub link: LinkLayer,
    pub data: Vec<u8>,
}

/// Assigns frame numbers and inter-arrival deltas in delivery order.
#[derive(Debug, Default)]
pub struct FrameClock {
    last_timestamp: Option<f64>,
    frames: u64,
}

impl FrameClock {
    pub fn stamp(&mut self, timestamp: f64, link: LinkLayer, data: Vec<u8>) -> RawFrame {
        self.frames += 1;
        let time_delta = match self.last_timestamp {
            Some(prev) => timestamp - prev,
            None => 0.0,
        };
        self.last_timestamp = Some(timestamp);
        RawFrame {
            number: self.frames,
            timestamp,
            time_delta,
            link,
            data,
        }
    }
}

/// Pull-based, ordered source of frames.
///
/// `Ok(None)` is exhaustion; an `Err` is fatal for the run.
pub trait PacketSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>>;
}

/// In-memory source, mostly for tests and replaying decoded buffers.
pub struct FrameList {
    frames: std::vec::IntoIter<(f64, LinkLayer, Vec<u8>)>,
    clock: FrameClock,
}

impl FrameList {
    pub fn new(frames: Vec<(f64, LinkLayer, Vec<u8>)>) -> Self {
        Self {
            frames: frames.into_iter(),
            clock: FrameClock::default(),
        }
    }
}

impl PacketSource for FrameList {
    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        Ok(self
            .frames
            .next()
            .map(|(ts, link, data)| self.clock.stamp(ts, link, data)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Interface {
    link: LinkLayer,
    /// Timestamp units per second
    units_per_sec: f64,
    offset_secs: f64,
}

/// Per-file decoding state, kept apart from the reader so blocks borrowed
/// from the reader can be handled while it is still borrowed.
#[derive(Debug, Default)]
struct BlockDecoder {
    legacy_link: Option<LinkLayer>,
    legacy_nanos: bool,
    interfaces: Vec<Interface>,
    clock: FrameClock,
}

impl BlockDecoder {
    fn decode(&mut self, block: PcapBlockOwned<'_>) -> Option<RawFrame> {
        match block {
            PcapBlockOwned::LegacyHeader(header) => {
                let link = LinkLayer::from(header.network);
                info!(
                    "pcap header: v{}.{}, link type {:?}, snaplen {}",
                    header.version_major, header.version_minor, link, header.snaplen
                );
                self.legacy_link = Some(link);
                self.legacy_nanos = header.is_nanosecond_precision();
                None
            }
            PcapBlockOwned::Legacy(packet) => {
                let link = self.legacy_link.unwrap_or(LinkLayer::Ethernet);
                let fraction = if self.legacy_nanos {
                    packet.ts_usec as f64 / 1e9
                } else {
                    packet.ts_usec as f64 / 1e6
                };
                let timestamp = packet.ts_sec as f64 + fraction;
                let caplen = (packet.caplen as usize).min(packet.data.len());
                Some(self.clock.stamp(timestamp, link, packet.data[..caplen].to_vec()))
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                self.interfaces.clear();
                None
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                self.interfaces.push(Interface {
                    link: LinkLayer::from(idb.linktype),
                    units_per_sec: ts_units_per_sec(idb.if_tsresol),
                    offset_secs: idb.if_tsoffset as f64,
                });
                None
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let Some(iface) = self.interfaces.get(epb.if_id as usize).copied() else {
                    warn!("enhanced packet block for unknown interface {}, skipped", epb.if_id);
                    return None;
                };
                let ticks = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                let timestamp = ticks as f64 / iface.units_per_sec + iface.offset_secs;
                let caplen = (epb.caplen as usize).min(epb.data.len());
                Some(self.clock.stamp(timestamp, iface.link, epb.data[..caplen].to_vec()))
            }
            PcapBlockOwned::NG(Block::SimplePacket(_)) => {
                // no timestamp, cannot place it in time
                debug!("simple packet block skipped");
                None
            }
            PcapBlockOwned::NG(_) => None,
        }
    }
}

/// pcapng `if_tsresol`: high bit set means a power of two, otherwise of ten.
/// Absent option (0 from the parser) defaults to microseconds.
fn ts_units_per_sec(tsresol: u8) -> f64 {
    let exponent = (tsresol & 0x7f) as i32;
    if tsresol == 0 {
        1e6
    } else if tsresol & 0x80 != 0 {
        2f64.powi(exponent)
    } else {
        10f64.powi(exponent)
    }
}

/// Reads legacy pcap and pcapng captures.
pub struct PcapFileSource {
    reader: Box<dyn PcapReaderIterator>,
    decoder: BlockDecoder,
    stalled_refills: u32,
}

impl PcapFileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| FlowError::IoError(format!("cannot open {}: {}", path.display(), e)))?;
        info!("Reading capture {}", path.display());
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read + 'static>(reader: R) -> Result<Self> {
        let reader = pcap_parser::create_reader(READER_CAPACITY, reader)
            .map_err(|e| FlowError::CaptureError(format!("not a pcap or pcapng capture: {:?}", e)))?;
        Ok(Self {
            reader,
            decoder: BlockDecoder::default(),
            stalled_refills: 0,
        })
    }
}

impl PacketSource for PcapFileSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let Self {
            reader,
            decoder,
            stalled_refills,
        } = self;
        loop {
            match reader.next() {
                Ok((offset, block)) => {
                    *stalled_refills = 0;
                    let frame = decoder.decode(block);
                    reader.consume(offset);
                    if frame.is_some() {
                        return Ok(frame);
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete { .. }) => {
                    // a second refill without progress means the last block is cut short
                    if *stalled_refills >= 1 {
                        warn!("capture ends with a truncated block, stopping");
                        return Ok(None);
                    }
                    *stalled_refills += 1;
                    reader
                        .refill()
                        .map_err(|e| FlowError::CaptureError(format!("refill error: {:?}", e)))?;
                }
                Err(e) => return Err(FlowError::CaptureError(format!("pcap parse error: {:?}", e))),
            }
        }
    }
}
