use std::fs;
use std::path::Path;

use crate::error::Result;

/// FPGA bitstreams shipped for the SIGMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    /// 50 MHz, supports 8 bit clock fractions.
    Mhz50,
    Mhz100,
    Mhz200,
}

impl Firmware {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Mhz50 => "asix-sigma-50.fw",
            Self::Mhz100 => "asix-sigma-100.fw",
            Self::Mhz200 => "asix-sigma-200.fw",
        }
    }
}

/// Descrambles a firmware image and expands it into the bit-bang stream
/// clocking it into the FPGA: two bytes per bit, MSB first.
pub fn bin2bitbang(image: &[u8]) -> Result<Vec<u8>> {
    let mut stream = Vec::new();
    stream.try_reserve_exact(image.len() * 16)?;

    let mut imm: u32 = 0x3f6d_f2ab;
    for &byte in image {
        imm = ((imm.wrapping_add(0x0a85_3753)) % 177).wrapping_add(imm.wrapping_mul(0x0803_4052));
        let byte = byte ^ imm as u8;
        for bit in (0..8).rev() {
            let v = if byte & (1 << bit) != 0 { 0x40 } else { 0x00 };
            stream.push(v | 0x01);
            stream.push(v);
        }
    }
    Ok(stream)
}

/// Reads `firmware` from `dir` and converts it for upload.
pub fn load(dir: &Path, firmware: Firmware) -> Result<Vec<u8>> {
    let path = dir.join(firmware.file_name());
    log::debug!("Reading firmware {}", path.display());
    let image = fs::read(&path)?;
    bin2bitbang(&image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitbang_expands_sixteen_bytes_per_input_byte() {
        let stream = bin2bitbang(&[0x00, 0xff, 0x5a]).unwrap();
        assert_eq!(stream.len(), 48);
        // Every bit is a clock-high byte followed by the same level clock-low.
        for pair in stream.chunks_exact(2) {
            assert_eq!(pair[0], pair[1] | 0x01);
            assert!(pair[1] == 0x00 || pair[1] == 0x40);
        }
    }

    #[test]
    fn test_first_byte_is_descrambled() {
        // The first key byte is 0x3a, so 0x3a decodes to an all-low bitstream.
        let stream = bin2bitbang(&[0x3a]).unwrap();
        assert!(stream.chunks_exact(2).all(|pair| pair == [0x01, 0x00]));
        let stream = bin2bitbang(&[0x3a ^ 0x80]).unwrap();
        assert_eq!(&stream[..4], &[0x41, 0x40, 0x01, 0x00]);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = Path::new("/nonexistent/sampleflow-firmware");
        assert!(load(dir, Firmware::Mhz50).is_err());
    }
}
