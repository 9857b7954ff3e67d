//! Reconstruction of the sample stream from DRAM rows.
//!
//! A row holds 64 clusters. Each cluster starts with a 16 bit timestamp and
//! carries 7 events, 20 ns apart; depending on the firmware an event packs
//! 1, 2 or 4 consecutive samples per probe. The hardware only records a
//! cluster when an input changes, so gaps between timestamps are filled by
//! repeating the last sample.

use super::protocol::{CHUNK_SIZE, CLUSTERS_PER_CHUNK, CLUSTER_SIZE, EVENTS_PER_CLUSTER};
use super::trigger::SigmaTrigger;
use crate::datafeed::{Logic, Packet};
use crate::error::Result;

/// Upper bound on the samples carried by one logic packet.
pub const SEGMENT_SAMPLES: usize = 2048;

/// Padding needed in front of a cluster whose timestamp is `tsdiff` after
/// the previous one.
pub fn padding_len(tsdiff: u16, samples_per_event: usize) -> usize {
    (usize::from(tsdiff) * samples_per_event).saturating_sub(EVENTS_PER_CLUSTER * samples_per_event)
}

/// Cluster of a chunk holding the hardware trigger, from the trigger
/// position within that chunk.
pub fn trigger_cluster(triggerpos: u32, samples_per_event: usize) -> usize {
    let mut pos = (triggerpos & 0x1ff) as usize;
    if samples_per_event == 1 {
        pos = pos.saturating_sub(EVENTS_PER_CLUSTER - 1);
    }
    pos / EVENTS_PER_CLUSTER
}

/// End of the valid data in the final row, relative to the timestamp the
/// row follows. Timestamps wrap at 16 bits, so only distances are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopClip {
    pub base: u16,
    pub offset: u16,
}

impl StopClip {
    pub fn excludes(self, ts: u16) -> bool {
        ts.wrapping_sub(self.base) > self.offset
    }
}

/// Where to cut a chunk short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkLimits {
    /// Cluster holding the hardware trigger.
    pub trigger_cluster: Option<usize>,
    pub stop: Option<StopClip>,
}

pub struct ChunkDecoder {
    samples_per_event: usize,
    num_probes: usize,
    lastts: u16,
    lastsample: u16,
    trigger: SigmaTrigger,
    report_trigger: bool,
    /// Remaining samples before the sample limit, if one is set.
    remaining: Option<u64>,
    emitted: u64,
    samples: Vec<u16>,
    bytes: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new(samples_per_event: usize, num_probes: usize) -> Self {
        Self {
            samples_per_event,
            num_probes,
            lastts: 0,
            lastsample: 0,
            trigger: SigmaTrigger::default(),
            report_trigger: false,
            remaining: None,
            emitted: 0,
            samples: Vec::new(),
            bytes: Vec::new(),
        }
    }

    /// Condition refined in software in the trigger cluster. A trigger
    /// packet is only sent when `report` is set.
    pub fn with_trigger(mut self, trigger: SigmaTrigger, report: bool) -> Self {
        self.trigger = trigger;
        self.report_trigger = report;
        self
    }

    /// Stops emitting after `limit` samples; 0 means no limit.
    pub fn with_sample_limit(mut self, limit: u64) -> Self {
        self.remaining = (limit > 0).then_some(limit);
        self
    }

    /// Primes the timestamp tracker from the first row of a capture.
    pub fn start(&mut self, first_chunk: &[u8]) {
        let ts = first_chunk
            .get(..2)
            .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]));
        self.lastts = ts.wrapping_sub(1);
        self.lastsample = 0;
    }

    pub fn lastts(&self) -> u16 {
        self.lastts
    }

    pub fn samples_emitted(&self) -> u64 {
        self.emitted
    }

    /// Whether the sample limit has been reached.
    pub fn is_done(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Decodes one row, handing logic and trigger packets to `emit`.
    pub fn decode_chunk(
        &mut self,
        chunk: &[u8],
        limits: ChunkLimits,
        emit: &mut dyn FnMut(&Packet<'_>),
    ) -> Result<()> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("sigma decode_chunk"), 0));

        let cluster_samples = EVENTS_PER_CLUSTER * self.samples_per_event;
        self.samples.clear();
        self.samples.try_reserve(cluster_samples)?;

        for (i, cluster) in chunk
            .chunks_exact(CLUSTER_SIZE)
            .take(CLUSTERS_PER_CHUNK)
            .enumerate()
        {
            if self.is_done() {
                return Ok(());
            }
            let ts = u16::from_le_bytes([cluster[0], cluster[1]]);
            let tsdiff = ts.wrapping_sub(self.lastts);
            self.lastts = ts;

            if limits.stop.is_some_and(|stop| stop.excludes(ts)) {
                return Ok(());
            }

            let pad = padding_len(tsdiff, self.samples_per_event);
            if pad > 0 {
                self.emit_padding(pad, emit)?;
            }

            self.samples.clear();
            for event in cluster[2..].chunks_exact(2) {
                let event = u16::from_le_bytes([event[0], event[1]]);
                for k in 0..self.samples_per_event {
                    let mut sample = 0u16;
                    for probe in 0..self.num_probes {
                        if event & (1 << (probe * self.samples_per_event + k)) != 0 {
                            sample |= 1 << probe;
                        }
                    }
                    self.samples.push(sample);
                }
            }

            let mut sent = 0;
            if limits.trigger_cluster == Some(i) {
                let offset = self.trigger.offset(&self.samples, self.lastsample);
                if offset > 0 {
                    self.emit_range(0, offset, emit)?;
                    sent = offset;
                }
                if self.report_trigger && !self.is_done() {
                    emit(&Packet::Trigger);
                }
            }
            self.emit_range(sent, self.samples.len(), emit)?;

            if let Some(&last) = self.samples.last() {
                self.lastsample = last;
            }
        }
        Ok(())
    }

    fn take_budget(&mut self, wanted: usize) -> usize {
        match &mut self.remaining {
            Some(remaining) => {
                let n = wanted.min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                *remaining -= n as u64;
                n
            }
            None => wanted,
        }
    }

    fn emit_padding(&mut self, count: usize, emit: &mut dyn FnMut(&Packet<'_>)) -> Result<()> {
        let mut left = self.take_budget(count);
        let segment = left.min(SEGMENT_SAMPLES);
        self.bytes.clear();
        self.bytes.try_reserve(segment * 2)?;
        for _ in 0..segment {
            self.bytes.extend_from_slice(&self.lastsample.to_le_bytes());
        }
        while left > 0 {
            let n = left.min(SEGMENT_SAMPLES);
            emit(&Packet::Logic(Logic {
                unitsize: 2,
                data: &self.bytes[..n * 2],
            }));
            self.emitted += n as u64;
            left -= n;
        }
        Ok(())
    }

    fn emit_range(&mut self, start: usize, end: usize, emit: &mut dyn FnMut(&Packet<'_>)) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        let n = self.take_budget(end - start);
        if n == 0 {
            return Ok(());
        }
        self.bytes.clear();
        self.bytes.try_reserve(n * 2)?;
        for sample in &self.samples[start..start + n] {
            self.bytes.extend_from_slice(&sample.to_le_bytes());
        }
        emit(&Packet::Logic(Logic {
            unitsize: 2,
            data: &self.bytes,
        }));
        self.emitted += n as u64;
        Ok(())
    }
}

/// Splits a read buffer into rows.
pub fn chunks(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    buf.chunks_exact(CHUNK_SIZE)
}


#[cfg(test)]
mod tests {
    use super::testdata::chunk;
    use super::*;

    fn collect(decoder: &mut ChunkDecoder, chunk: &[u8], limits: ChunkLimits) -> (Vec<u16>, Option<usize>) {
        let mut samples = Vec::new();
        let mut trigger_at = None;
        decoder
            .decode_chunk(chunk, limits, &mut |packet: &Packet<'_>| match packet {
                Packet::Logic(logic) => {
                    assert_eq!(logic.unitsize, 2);
                    assert!(logic.num_samples() <= SEGMENT_SAMPLES);
                    samples.extend((0..logic.num_samples()).filter_map(|i| logic.sample(i).map(|s| s as u16)));
                }
                Packet::Trigger => trigger_at = Some(samples.len()),
                _ => {}
            })
            .unwrap();
        (samples, trigger_at)
    }

    fn consecutive(first_ts: u16, count: usize, step: u16) -> Vec<(u16, [u16; 7])> {
        (0..count)
            .map(|i| (first_ts.wrapping_add(step * i as u16), [i as u16; 7]))
            .collect()
    }

    #[test]
    fn test_padding_len() {
        assert_eq!(padding_len(1, 1), 0);
        assert_eq!(padding_len(7, 1), 0);
        assert_eq!(padding_len(10, 1), 3);
        assert_eq!(padding_len(10, 2), 6);
        assert_eq!(padding_len(3, 4), 0);
        assert_eq!(padding_len(100, 4), 372);
    }

    #[test]
    fn test_consecutive_clusters_need_no_padding() {
        let data = chunk(&consecutive(100, 64, 1), 0);
        let mut decoder = ChunkDecoder::new(1, 16);
        decoder.start(&data);
        let (samples, _) = collect(&mut decoder, &data, ChunkLimits::default());
        assert_eq!(samples.len(), 64 * 7);
        assert_eq!(samples[7], 1);
        assert_eq!(decoder.lastts(), 163);
    }

    #[test]
    fn test_gap_between_chunks_is_padded_with_last_sample() {
        let first = chunk(&consecutive(100, 64, 1), 0);
        // 10 cluster widths after the last cluster of the first row.
        let second = chunk(&[(173, [0x00aa; 7])], u16::MAX);
        let mut decoder = ChunkDecoder::new(1, 16);
        decoder.start(&first);
        collect(&mut decoder, &first, ChunkLimits::default());
        let limits = ChunkLimits {
            trigger_cluster: None,
            stop: Some(StopClip { base: 163, offset: 10 }),
        };
        let (samples, _) = collect(&mut decoder, &second, limits);
        assert_eq!(samples.len(), padding_len(10, 1) + 7);
        assert!(samples[..3].iter().all(|s| *s == 63));
        assert!(samples[3..].iter().all(|s| *s == 0x00aa));
    }

    #[test]
    fn test_long_gap_is_split_into_segments() {
        let data = chunk(&[(0, [0; 7]), (5000, [1; 7])], 20_000);
        let mut decoder = ChunkDecoder::new(1, 16);
        decoder.start(&data);
        let (samples, _) = collect(
            &mut decoder,
            &data,
            ChunkLimits {
                trigger_cluster: None,
                stop: Some(StopClip {
                    base: u16::MAX,
                    offset: 5001,
                }),
            },
        );
        assert_eq!(samples.len(), 7 + 4993 + 7);
    }

    #[test]
    fn test_stop_timestamp_clips_chunk() {
        let data = chunk(&consecutive(10, 5, 1), 500);
        let mut decoder = ChunkDecoder::new(1, 16);
        decoder.start(&data);
        let limits = ChunkLimits {
            trigger_cluster: None,
            stop: Some(StopClip { base: 9, offset: 5 }),
        };
        let (samples, _) = collect(&mut decoder, &data, limits);
        assert_eq!(samples.len(), 5 * 7);
    }

    #[test]
    fn test_stop_clip_across_timestamp_wrap() {
        // 15 valid clusters running from 65530 through the wrap up to 8.
        let data = chunk(&consecutive(65530, 15, 1), 300);
        let mut decoder = ChunkDecoder::new(1, 16);
        decoder.start(&data);
        assert_eq!(decoder.lastts(), 65529);
        let limits = ChunkLimits {
            trigger_cluster: None,
            stop: Some(StopClip {
                base: decoder.lastts(),
                offset: 15,
            }),
        };
        let (samples, _) = collect(&mut decoder, &data, limits);
        assert_eq!(samples.len(), 15 * 7);
        assert_eq!(decoder.lastts(), 300);
    }

    #[test]
    fn test_stop_clip_compares_distances() {
        let stop = StopClip {
            base: 65500,
            offset: 100,
        };
        assert!(!stop.excludes(65501));
        assert!(!stop.excludes(64));
        assert!(stop.excludes(65));
        assert!(stop.excludes(65400));
    }

    #[test]
    fn test_sample_limit_is_exact() {
        let data = chunk(&consecutive(10, 64, 1), 0);
        let mut decoder = ChunkDecoder::new(1, 16).with_sample_limit(100);
        decoder.start(&data);
        let (samples, _) = collect(&mut decoder, &data, ChunkLimits::default());
        assert_eq!(samples.len(), 100);
        assert!(decoder.is_done());
        assert_eq!(decoder.samples_emitted(), 100);
    }

    #[test]
    fn test_fast_mode_unpacks_interleaved_samples() {
        // 100 MHz: 8 probes, two samples per event; probe l sample k is bit
        // l * 2 + k. Probe 0 high in the second sample only.
        let data = chunk(&[(5, [0b10; 7])], u16::MAX);
        let mut decoder = ChunkDecoder::new(2, 8);
        decoder.start(&data);
        let limits = ChunkLimits {
            trigger_cluster: None,
            stop: Some(StopClip { base: 4, offset: 1 }),
        };
        let (samples, _) = collect(&mut decoder, &data, limits);
        assert_eq!(samples.len(), 14);
        assert_eq!(&samples[..4], &[0, 1, 0, 1]);
    }

    #[test]
    fn test_trigger_packet_at_exact_sample() {
        let mut clusters = consecutive(100, 64, 1);
        for (i, cluster) in clusters.iter_mut().enumerate() {
            cluster.1 = [0; 7];
            if i == 10 {
                cluster.1 = [0, 0, 0, 1, 1, 1, 1];
            } else if i > 10 {
                cluster.1 = [1; 7];
            }
        }
        let data = chunk(&clusters, 0);
        let trigger = SigmaTrigger {
            risingmask: 1,
            ..SigmaTrigger::default()
        };
        let mut decoder = ChunkDecoder::new(1, 16).with_trigger(trigger, true);
        decoder.start(&data);
        let limits = ChunkLimits {
            trigger_cluster: Some(trigger_cluster(76, 1)),
            stop: None,
        };
        let (samples, trigger_at) = collect(&mut decoder, &data, limits);
        assert_eq!(samples.len(), 64 * 7);
        assert_eq!(trigger_at, Some(73));
    }

    #[test]
    fn test_trigger_cluster() {
        assert_eq!(trigger_cluster(76, 1), 10);
        assert_eq!(trigger_cluster(3, 1), 0);
        assert_eq!(trigger_cluster(512 + 76, 1), 10);
        assert_eq!(trigger_cluster(76, 2), 10);
        assert_eq!(trigger_cluster(70, 4), 10);
    }
}
