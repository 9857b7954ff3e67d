//! Datafeed consumer gathering logic samples into a `polars` table.

use std::cell::RefCell;
use std::rc::Rc;

use polars::prelude::*;

use crate::datafeed::Packet;
use crate::device::{DeviceKey, Probe, ProbeKind};
use crate::session::Session;

pub const SAMPLE_COLUMN_NAME: &str = "sample";

#[derive(Debug, Default)]
struct Captured {
    samples: Vec<u64>,
    trigger: Option<usize>,
    finished: bool,
}

/// Logic samples of one device, as received from the datafeed.
///
/// Clones share the same buffer, so a clone can be handed to the session
/// while this handle is read once the run is over.
#[derive(Debug, Clone)]
pub struct LogicCapture {
    device: DeviceKey,
    captured: Rc<RefCell<Captured>>,
}

impl LogicCapture {
    pub fn new(device: DeviceKey) -> Self {
        Self {
            device,
            captured: Rc::default(),
        }
    }

    /// Creates a capture and registers it as consumer of `session`.
    pub fn attach(session: &mut Session, device: DeviceKey) -> Self {
        let capture = Self::new(device);
        let sink = capture.clone();
        session.add_consumer(move |dev, packet| sink.record(dev, packet));
        capture
    }

    pub fn record(&self, dev: &DeviceKey, packet: &Packet<'_>) {
        if *dev != self.device {
            return;
        }
        let mut captured = self.captured.borrow_mut();
        match packet {
            Packet::Header(_) => *captured = Captured::default(),
            Packet::Logic(logic) => {
                let n = logic.num_samples();
                captured.samples.reserve(n);
                captured.samples.extend((0..n).filter_map(|i| logic.sample(i)));
            }
            Packet::Trigger => {
                if captured.trigger.is_none() {
                    captured.trigger = Some(captured.samples.len());
                }
            }
            Packet::End => captured.finished = true,
            _ => {}
        }
    }

    pub fn num_samples(&self) -> usize {
        self.captured.borrow().samples.len()
    }

    /// Index of the first sample after the trigger point.
    pub fn trigger_index(&self) -> Option<usize> {
        self.captured.borrow().trigger
    }

    pub fn is_finished(&self) -> bool {
        self.captured.borrow().finished
    }

    /// One boolean column per logic probe, named after the probe, next to
    /// the sample index.
    pub fn to_dataframe(&self, probes: &[Probe]) -> Result<DataFrame, PolarsError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("LogicCapture::to_dataframe"), 0));

        let captured = self.captured.borrow();
        let index: Vec<u64> = (0..captured.samples.len() as u64).collect();
        let mut columns: Vec<Column> = vec![Series::new(SAMPLE_COLUMN_NAME.into(), index).into()];

        for probe in probes.iter().filter(|p| p.kind == ProbeKind::Logic && p.enabled) {
            let values: Vec<bool> = captured
                .samples
                .iter()
                .map(|sample| probe.index < 64 && (sample >> probe.index) & 1 == 1)
                .collect();
            columns.push(Series::new(probe.name.as_str().into(), values).into());
        }

        DataFrame::new(columns)
    }
}
