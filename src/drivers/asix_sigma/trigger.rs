//! Trigger configuration: per-probe trigger specs, the software matcher used
//! to pinpoint the trigger sample, and the lookup table compiler for the
//! 50 MHz firmware.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error("only a single pin trigger is supported in 100 and 200 MHz mode")]
    MultiplePinsFast,

    #[error("only rising/falling triggers are supported in 100 and 200 MHz mode")]
    LevelInFastMode,

    #[error("only one rising/falling trigger is supported")]
    MultipleEdges,

    #[error("unsupported trigger type '{0}'")]
    UnsupportedType(char),

    #[error("probe {0} cannot take part in a trigger")]
    ProbeOutOfRange(usize),
}

/// Trigger condition in terms of probe bit masks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigmaTrigger {
    pub risingmask: u16,
    pub fallingmask: u16,
    pub simplemask: u16,
    pub simplevalue: u16,
}

impl SigmaTrigger {
    /// Builds the condition from `(probe index, trigger spec)` pairs of the
    /// enabled probes. `fast` selects the single-pin rules of the 100 and
    /// 200 MHz firmware.
    pub fn configure<'a>(
        specs: impl IntoIterator<Item = (usize, &'a str)>,
        fast: bool,
    ) -> Result<Self, TriggerError> {
        let mut trigger = Self::default();
        let mut edges = 0;

        for (index, spec) in specs {
            let Some(kind) = spec.chars().next() else {
                continue;
            };
            let bit = u32::try_from(index)
                .ok()
                .and_then(|i| 1u16.checked_shl(i))
                .ok_or(TriggerError::ProbeOutOfRange(index))?;

            if fast {
                if edges > 0 {
                    return Err(TriggerError::MultiplePinsFast);
                }
                match kind {
                    'r' => trigger.risingmask |= bit,
                    'f' => trigger.fallingmask |= bit,
                    '0' | '1' => return Err(TriggerError::LevelInFastMode),
                    other => return Err(TriggerError::UnsupportedType(other)),
                }
                edges += 1;
            } else {
                match kind {
                    '1' => {
                        trigger.simplevalue |= bit;
                        trigger.simplemask |= bit;
                    }
                    '0' => {
                        trigger.simplevalue &= !bit;
                        trigger.simplemask |= bit;
                    }
                    'r' => {
                        trigger.risingmask |= bit;
                        edges += 1;
                    }
                    'f' => {
                        trigger.fallingmask |= bit;
                        edges += 1;
                    }
                    other => return Err(TriggerError::UnsupportedType(other)),
                }
                // The hardware has two edge detectors, but they can only be ORed.
                if edges > 1 {
                    return Err(TriggerError::MultipleEdges);
                }
            }
        }
        Ok(trigger)
    }

    pub fn is_set(&self) -> bool {
        (self.risingmask | self.fallingmask | self.simplemask) != 0
    }

    fn matches(&self, last: u16, sample: u16) -> bool {
        (sample & self.simplemask) == self.simplevalue
            && (last & self.risingmask) == 0
            && (sample & self.risingmask) == self.risingmask
            && (last & self.fallingmask) == self.fallingmask
            && (sample & self.fallingmask) == 0
    }

    /// Index of the first of up to 8 samples matching the condition. The
    /// hardware fires slightly early, so the exact sample is searched in
    /// the samples following its report; 0 when nothing matches.
    pub fn offset(&self, samples: &[u16], mut last: u16) -> usize {
        for (i, &sample) in samples.iter().take(8).enumerate() {
            if self.matches(last, sample) {
                return i;
            }
            last = sample;
        }
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOp {
    Level,
    Not,
    Rise,
    Fall,
    RiseFall,
    NotRise,
    NotFall,
    NotRiseFall,
}

impl TriggerOp {
    /// Truth table indexed by `[previous][current]`.
    fn table(self) -> [[bool; 2]; 2] {
        let mut x = [[false; 2]; 2];
        match self {
            Self::Level => {
                x[0][1] = true;
                x[1][1] = true;
            }
            Self::Not => {
                x[0][0] = true;
                x[1][0] = true;
            }
            Self::Rise => x[0][1] = true,
            Self::Fall => x[1][0] = true,
            Self::RiseFall => {
                x[0][1] = true;
                x[1][0] = true;
            }
            Self::NotRise => {
                x[1][1] = true;
                x[0][0] = true;
                x[1][0] = true;
            }
            Self::NotFall => {
                x[1][1] = true;
                x[0][0] = true;
                x[0][1] = true;
            }
            Self::NotRiseFall => {
                x[1][1] = true;
                x[0][0] = true;
            }
        }
        x
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerFunc {
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Nxor,
}

/// One 16 bit table per probe quad: bit `j` is set when the quad's four
/// probes, read as the number `j`, satisfy `value` under `mask`.
pub fn build_lut_entry(value: u16, mask: u16) -> [u16; 4] {
    let mut entry = [0xffffu16; 4];
    for (quad, word) in entry.iter_mut().enumerate() {
        for j in 0..16u16 {
            for k in 0..4 {
                let bit = 1u16 << (quad * 4 + k);
                let wanted = value & bit != 0;
                let seen = j & (1 << k) != 0;
                if mask & bit != 0 && wanted != seen {
                    *word &= !(1 << j);
                }
            }
        }
    }
    entry
}

/// Combines `op`, applied to edge detector `index`, into `mask` with `func`.
pub fn add_trigger_function(op: TriggerOp, func: TriggerFunc, index: usize, neg: bool, mask: &mut u16) {
    let mut x = op.table();
    if neg {
        // Point reflection of the 2x2 table.
        x = [[x[1][1], x[1][0]], [x[0][1], x[0][0]]];
    }

    for i in 0..16 {
        let a = (i >> (2 * index)) & 1;
        let b = (i >> (2 * index + 1)) & 1;
        let aset = (*mask >> i) & 1 == 1;
        let bset = x[b][a];

        let mut rset = match func {
            TriggerFunc::And | TriggerFunc::Nand => aset & bset,
            TriggerFunc::Or | TriggerFunc::Nor => aset | bset,
            TriggerFunc::Xor | TriggerFunc::Nxor => aset ^ bset,
        };
        if matches!(func, TriggerFunc::Nand | TriggerFunc::Nor | TriggerFunc::Nxor) {
            rset = !rset;
        }

        *mask &= !(1 << i);
        if rset {
            *mask |= 1 << i;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerParams {
    pub selc: u8,
    pub selpresc: u8,
    pub selinc: u8,
    pub selres: u8,
    pub sela: u8,
    pub selb: u8,
    pub cmpb: u16,
    pub cmpa: u16,
}

impl TriggerParams {
    /// Register layout: two bytes of packed selectors, then both
    /// comparators little endian.
    pub fn to_bytes(&self) -> [u8; 6] {
        let cmpb = self.cmpb.to_le_bytes();
        let cmpa = self.cmpa.to_le_bytes();
        [
            (self.selc & 0x3) | (self.selpresc << 2),
            (self.selinc & 0x3) | ((self.selres & 0x3) << 2) | ((self.sela & 0x3) << 4) | ((self.selb & 0x3) << 6),
            cmpb[0],
            cmpb[1],
            cmpa[0],
            cmpa[1],
        ]
    }
}

/// Compiled trigger program of the 50 MHz firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerLut {
    /// Edge detector inputs.
    pub m0d: [u16; 4],
    pub m1d: [u16; 4],
    /// Value/mask condition.
    pub m2d: [u16; 4],
    /// Glue logic over both edge detectors.
    pub m3: u16,
    pub m3s: u16,
    pub m4: u16,
    pub params: TriggerParams,
}

impl TriggerLut {
    /// Simple value/mask condition plus at most two edges.
    pub fn basic(trigger: &SigmaTrigger) -> Self {
        let mut lut = Self {
            m4: 0xa000,
            m2d: build_lut_entry(trigger.simplevalue, trigger.simplemask),
            ..Self::default()
        };

        let mut masks = [0u16; 2];
        let edges = trigger.risingmask | trigger.fallingmask;
        for (slot, bit) in masks
            .iter_mut()
            .zip((0..16).map(|i| 1u16 << i).filter(|bit| edges & bit != 0))
        {
            *slot = bit;
        }

        lut.m0d = build_lut_entry(masks[0], masks[0]);
        lut.m1d = build_lut_entry(masks[1], masks[1]);

        if masks[0] != 0 || masks[1] != 0 {
            for (index, mask) in masks.iter().enumerate() {
                if mask & trigger.risingmask != 0 {
                    add_trigger_function(TriggerOp::Rise, TriggerFunc::Or, index, false, &mut lut.m3);
                }
                if mask & trigger.fallingmask != 0 {
                    add_trigger_function(TriggerOp::Fall, TriggerFunc::Or, index, false, &mut lut.m3);
                }
            }
        } else {
            lut.m3 = 0xffff;
        }

        // Trigger type: event.
        lut.params.selres = 3;
        lut
    }

    /// The tables transposed into the 16 two-byte rows the hardware expects,
    /// one per LUT address.
    pub fn select_rows(&self) -> [[u8; 2]; 16] {
        let mut rows = [[0u8; 2]; 16];
        for (i, row) in rows.iter_mut().enumerate() {
            let bit = 1u16 << i;
            let set = |word: u16, flag: u8| if word & bit != 0 { flag } else { 0 };
            for q in 0..4 {
                row[0] |= set(self.m2d[q], 1 << q);
                row[1] |= set(self.m0d[q], 1 << q);
                row[1] |= set(self.m1d[q], 1 << (q + 4));
            }
            row[0] |= set(self.m3, 0x10) | set(self.m3s, 0x20) | set(self.m4, 0x40);
        }
        rows
    }

    /// Software model of the table: whether the transition from `last` to
    /// `sample` fires the trigger.
    pub fn accepts(&self, last: u16, sample: u16) -> bool {
        let quads = |entry: &[u16; 4], value: u16| {
            entry
                .iter()
                .enumerate()
                .all(|(q, word)| (word >> ((value >> (q * 4)) & 0xf)) & 1 == 1)
        };
        if !quads(&self.m2d, sample) {
            return false;
        }
        let index = u16::from(quads(&self.m0d, sample))
            | u16::from(quads(&self.m0d, last)) << 1
            | u16::from(quads(&self.m1d, sample)) << 2
            | u16::from(quads(&self.m1d, last)) << 3;
        (self.m3 >> index) & 1 == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmasked_entry_accepts_everything() {
        for value in [0x0000, 0x1234, 0xffff] {
            assert_eq!(build_lut_entry(value, 0), [0xffff; 4]);
            let lut = TriggerLut::basic(&SigmaTrigger {
                simplevalue: value,
                ..SigmaTrigger::default()
            });
            for input in [0x0000, 0x0001, 0x8000, 0xbeef, 0xffff] {
                assert!(lut.accepts(0, input));
                assert!(lut.accepts(0xffff, input));
            }
        }
    }

    #[test]
    fn test_lut_entry_for_single_probe() {
        let entry = build_lut_entry(0x0001, 0x0001);
        assert_eq!(entry, [0xaaaa, 0xffff, 0xffff, 0xffff]);
        let entry = build_lut_entry(0x0000, 0x0010);
        assert_eq!(entry, [0xffff, 0x5555, 0xffff, 0xffff]);
    }

    #[test]
    fn test_trigger_functions() {
        let mut mask = 0;
        add_trigger_function(TriggerOp::Rise, TriggerFunc::Or, 0, false, &mut mask);
        assert_eq!(mask, 0x2222);
        add_trigger_function(TriggerOp::Fall, TriggerFunc::Or, 0, false, &mut mask);
        assert_eq!(mask, 0x6666);

        let mut mask = 0;
        add_trigger_function(TriggerOp::Rise, TriggerFunc::Or, 0, true, &mut mask);
        assert_eq!(mask, 0x4444);

        let mut mask = 0xffff;
        add_trigger_function(TriggerOp::Level, TriggerFunc::Nand, 1, false, &mut mask);
        assert_eq!(mask, 0x0f0f);
    }

    #[test]
    fn test_basic_rising_trigger() {
        let trigger = SigmaTrigger {
            risingmask: 0x0001,
            ..SigmaTrigger::default()
        };
        let lut = TriggerLut::basic(&trigger);
        assert_eq!(lut.m3, 0x2222);
        assert_eq!(lut.params.to_bytes(), [0x00, 0x0c, 0, 0, 0, 0]);
        assert!(lut.accepts(0x0000, 0x0001));
        assert!(!lut.accepts(0x0001, 0x0001));
        assert!(!lut.accepts(0x0001, 0x0000));

        let rows = lut.select_rows();
        // m4 = 0xa000 sets bit 0x40 on rows 13 and 15.
        assert_eq!(rows[13][0] & 0x40, 0x40);
        assert_eq!(rows[12][0] & 0x40, 0);
        // m3 bit 1 and m0d quad 0 bit 1 are set.
        assert_eq!(rows[1][0] & 0x10, 0x10);
        assert_eq!(rows[1][1] & 0x01, 0x01);
    }

    #[test]
    fn test_configure_slow_mode() {
        let trigger = SigmaTrigger::configure([(0, "1"), (1, "0"), (3, "f")], false).unwrap();
        assert_eq!(trigger.simplemask, 0b011);
        assert_eq!(trigger.simplevalue, 0b001);
        assert_eq!(trigger.fallingmask, 0b1000);
        assert!(trigger.is_set());

        let err = SigmaTrigger::configure([(0, "r"), (1, "f")], false).unwrap_err();
        assert_eq!(err, TriggerError::MultipleEdges);
        let err = SigmaTrigger::configure([(0, "x")], false).unwrap_err();
        assert_eq!(err, TriggerError::UnsupportedType('x'));
    }

    #[test]
    fn test_configure_fast_mode() {
        let trigger = SigmaTrigger::configure([(2, "f")], true).unwrap();
        assert_eq!(trigger.fallingmask, 0b100);

        let err = SigmaTrigger::configure([(0, "r"), (1, "r")], true).unwrap_err();
        assert_eq!(err, TriggerError::MultiplePinsFast);
        let err = SigmaTrigger::configure([(0, "1")], true).unwrap_err();
        assert_eq!(err, TriggerError::LevelInFastMode);
        assert!(!SigmaTrigger::configure([], true).unwrap().is_set());
    }

    #[test]
    fn test_offset_finds_edge() {
        let trigger = SigmaTrigger {
            risingmask: 0x0001,
            ..SigmaTrigger::default()
        };
        let samples = [0, 0, 0, 1, 1, 1, 1];
        assert_eq!(trigger.offset(&samples, 0), 3);
        // Already high before the cluster: no edge found.
        assert_eq!(trigger.offset(&[1, 1, 1], 1), 0);
        assert_eq!(trigger.offset(&[1, 1, 1], 0), 0);
    }
}
