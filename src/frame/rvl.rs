//! RVL depth compression
//!
//! Zero runs and non-zero runs alternate; each run length and each zigzagged
//! delta between consecutive non-zero samples is written as a variable-length
//! integer of 3-bit groups with a continuation bit. Nibbles are packed most
//! significant first into little-endian 32-bit words.

use crate::error::{Error, Result};

struct NibbleReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    word: u32,
    nibbles: u32,
}

impl<'a> NibbleReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            word: 0,
            nibbles: 0,
        }
    }

    fn next_word(&mut self) -> Result<u32> {
        let end = self.pos + 4;
        let chunk = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| Error::FrameDecode("RVL stream truncated".to_string()))?;
        self.pos = end;
        Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    fn read_vle(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        let mut bits: u32 = 29;
        loop {
            if self.nibbles == 0 {
                self.word = self.next_word()?;
                self.nibbles = 8;
            }
            let nibble = self.word & 0xf000_0000;
            value |= (nibble << 1) >> bits;
            self.word <<= 4;
            self.nibbles -= 1;

            if nibble & 0x8000_0000 == 0 {
                return Ok(value);
            }
            bits = bits
                .checked_sub(3)
                .ok_or_else(|| Error::FrameDecode("RVL value overflows 32 bits".to_string()))?;
        }
    }
}

struct NibbleWriter {
    out: Vec<u8>,
    word: u32,
    nibbles: u32,
}

impl NibbleWriter {
    fn write_vle(&mut self, mut value: u32) {
        loop {
            let mut nibble = value & 0x7;
            value >>= 3;
            if value != 0 {
                nibble |= 0x8;
            }
            self.word = (self.word << 4) | nibble;
            self.nibbles += 1;
            if self.nibbles == 8 {
                self.out.extend_from_slice(&self.word.to_le_bytes());
                self.word = 0;
                self.nibbles = 0;
            }
            if value == 0 {
                break;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.nibbles > 0 {
            let word = self.word << (4 * (8 - self.nibbles));
            self.out.extend_from_slice(&word.to_le_bytes());
        }
        self.out
    }
}

/// Up-front reservation for a decode. The header's pixel count is untrusted;
/// zero runs past this grow the buffer through `resize`.
fn initial_capacity(input_len: usize, pixel_count: usize) -> usize {
    pixel_count.min(input_len.saturating_mul(8))
}

/// Decode `pixel_count` depth samples
pub fn decompress(input: &[u8], pixel_count: usize) -> Result<Vec<u16>> {
    let mut reader = NibbleReader::new(input);
    let mut output = Vec::with_capacity(initial_capacity(input.len(), pixel_count));
    let mut previous: i64 = 0;

    while output.len() < pixel_count {
        let remaining = pixel_count - output.len();
        let zeros = reader.read_vle()? as usize;
        if zeros > remaining {
            return Err(Error::FrameDecode(format!(
                "RVL zero run of {} exceeds {} remaining pixels",
                zeros, remaining
            )));
        }
        output.resize(output.len() + zeros, 0);

        let remaining = pixel_count - output.len();
        let nonzeros = reader.read_vle()? as usize;
        if nonzeros > remaining {
            return Err(Error::FrameDecode(format!(
                "RVL value run of {} exceeds {} remaining pixels",
                nonzeros, remaining
            )));
        }
        for _ in 0..nonzeros {
            let positive = reader.read_vle()? as i64;
            let delta = (positive >> 1) ^ -(positive & 1);
            let current = previous + delta;
            let sample = u16::try_from(current).map_err(|_| {
                Error::FrameDecode(format!("RVL sample {} out of range", current))
            })?;
            output.push(sample);
            previous = current;
        }
    }

    Ok(output)
}

pub fn compress(samples: &[u16]) -> Vec<u8> {
    let mut writer = NibbleWriter {
        out: Vec::with_capacity(samples.len()),
        word: 0,
        nibbles: 0,
    };
    let mut previous: i32 = 0;
    let mut i = 0;

    while i < samples.len() {
        let zeros_start = i;
        while i < samples.len() && samples[i] == 0 {
            i += 1;
        }
        writer.write_vle((i - zeros_start) as u32);

        let values_start = i;
        while i < samples.len() && samples[i] != 0 {
            i += 1;
        }
        writer.write_vle((i - values_start) as u32);

        for &sample in &samples[values_start..i] {
            let current = sample as i32;
            let delta = current - previous;
            let positive = ((delta << 1) ^ (delta >> 31)) as u32;
            writer.write_vle(positive);
            previous = current;
        }
    }

    writer.finish()
}
