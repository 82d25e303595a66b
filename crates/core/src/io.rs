//! Bit-accurate reader/writer over a [`SectionTable`].
//!
//! The masking/shifting logic lives in exactly one place
//! ([`ByteIo::read_bits`]/[`write_bits`]): every bitfield-family pattern
//! routes through here instead of re-deriving the byte window itself.

use crate::error::PatternError;
use crate::section::{SectionId, SectionTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// The evaluator's current read position: a byte offset plus a sub-byte
/// bit offset in `[0, 8)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadCursor {
    pub byte: u64,
    pub bit: u8,
}

impl ReadCursor {
    pub fn new(byte: u64) -> Self {
        Self { byte, bit: 0 }
    }

    /// Round the bit part up to the next byte boundary.
    pub fn align(&mut self) {
        if self.bit != 0 {
            self.byte += 1;
            self.bit = 0;
        }
    }

    pub fn advance_bits(&mut self, bits: u64) {
        let total = self.bit as u64 + bits;
        self.byte += total / 8;
        self.bit = (total % 8) as u8;
    }
}

/// Owns the section table and the current read cursor, exposing the
/// byte/bit operations.
#[derive(Debug)]
pub struct ByteIo {
    sections: SectionTable,
    cursor: ReadCursor,
    /// When set, sequential consumption moves downward in address instead
    /// of upward; used by certain bitfield orderings.
    pub reversed: bool,
    pub allow_main_section_edits: bool,
}

impl Default for ByteIo {
    fn default() -> Self {
        Self {
            sections: SectionTable::new(),
            cursor: ReadCursor::default(),
            reversed: false,
            allow_main_section_edits: false,
        }
    }
}

impl ByteIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sections(&self) -> &SectionTable {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut SectionTable {
        &mut self.sections
    }

    pub fn cursor(&self) -> ReadCursor {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: ReadCursor) {
        self.cursor = cursor;
    }

    pub fn read_data(&self, section: SectionId, offset: u64, buf: &mut [u8]) -> Result<(), PatternError> {
        let section = self
            .sections
            .get(section)
            .ok_or_else(|| PatternError::eval("E_NO_SECTION", format!("no such section {section}")))?;
        section
            .read(offset, buf)
            .map_err(|e| PatternError::eval("E_READ", e))
    }

    pub fn write_data(&mut self, section: SectionId, offset: u64, buf: &[u8]) -> Result<(), PatternError> {
        if section == crate::section::MAIN && !self.allow_main_section_edits {
            return Err(PatternError::eval(
                "E_MAIN_READONLY",
                "writes to the MAIN section require allow_main_section_edits",
            ));
        }
        let section_ref = self
            .sections
            .get_mut(section)
            .ok_or_else(|| PatternError::eval("E_NO_SECTION", format!("no such section {section}")))?;
        section_ref
            .write(offset, buf)
            .map_err(|e| PatternError::eval("E_WRITE", e))
    }

    /// Return the current byte offset (after aligning to a byte boundary)
    /// and advance the cursor by `n` bytes.
    pub fn read_offset_and_increment(&mut self, n: u64) -> u64 {
        self.cursor.align();
        let offset = self.cursor.byte;
        if self.reversed {
            self.cursor.byte = self.cursor.byte.saturating_sub(n);
        } else {
            self.cursor.byte += n;
        }
        offset
    }

    /// Load the minimal byte window covering `[bit_offset, bit_offset +
    /// bit_size)` and extract it as a zero-aligned `u128`.
    ///
    /// `bit_offset` is always counted from the window's most significant
    /// bit for `Big`, and from its least significant bit for `Little` —
    /// matching each endian's natural bit-packing order, so a field that
    /// spans a byte boundary reads the same contiguous bitstream a
    /// sequential bitfield cursor assumed when laying fields out.
    pub fn read_bits(
        &self,
        section: SectionId,
        byte_offset: u64,
        bit_offset: u8,
        bit_size: u64,
        endian: Endian,
    ) -> Result<u128, PatternError> {
        if bit_size == 0 {
            return Ok(0);
        }
        if bit_size > 128 {
            return Err(PatternError::eval(
                "E_BIT_WIDTH",
                format!("bit_size {bit_size} exceeds the 128-bit literal width"),
            ));
        }
        let total_bits = bit_offset as u64 + bit_size;
        let byte_len = total_bits.div_ceil(8) as usize;

        let mut bytes = vec![0u8; byte_len];
        self.read_data(section, byte_offset, &mut bytes)?;

        let mut value = match endian {
            Endian::Little => {
                let mut v: u128 = 0;
                for (i, b) in bytes.iter().enumerate() {
                    v |= (*b as u128) << (8 * i);
                }
                v >> bit_offset
            }
            Endian::Big => {
                let mut v: u128 = 0;
                for b in &bytes {
                    v = (v << 8) | (*b as u128);
                }
                let shift = (byte_len as u64 * 8).saturating_sub(bit_offset as u64 + bit_size);
                v >> shift
            }
        };
        if bit_size < 128 {
            value &= (1u128 << bit_size) - 1;
        }
        Ok(value)
    }

    /// Read-modify-write under the same endian convention as
    /// [`Self::read_bits`].
    pub fn write_bits(
        &mut self,
        section: SectionId,
        byte_offset: u64,
        bit_offset: u8,
        bit_size: u64,
        endian: Endian,
        value: u128,
    ) -> Result<(), PatternError> {
        if bit_size == 0 {
            return Ok(());
        }
        let total_bits = bit_offset as u64 + bit_size;
        let byte_len = total_bits.div_ceil(8) as usize;

        let mut bytes = vec![0u8; byte_len];
        self.read_data(section, byte_offset, &mut bytes)?;

        let field_mask = if bit_size >= 128 { u128::MAX } else { (1u128 << bit_size) - 1 };

        match endian {
            Endian::Little => {
                let mut window: u128 = 0;
                for (i, b) in bytes.iter().enumerate() {
                    window |= (*b as u128) << (8 * i);
                }
                let mask = field_mask << bit_offset;
                window = (window & !mask) | ((value << bit_offset) & mask);
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = (window >> (8 * i)) as u8;
                }
            }
            Endian::Big => {
                let mut window: u128 = 0;
                for b in &bytes {
                    window = (window << 8) | (*b as u128);
                }
                let shift = (byte_len as u64 * 8).saturating_sub(bit_offset as u64 + bit_size);
                let mask = field_mask << shift;
                window = (window & !mask) | ((value << shift) & mask);
                for (i, b) in bytes.iter_mut().rev().enumerate() {
                    *b = (window >> (8 * i)) as u8;
                }
            }
        }
        self.write_data(section, byte_offset, &bytes)
    }

    pub fn read_string(&self, section: SectionId, offset: u64, max_len: u64) -> Result<String, PatternError> {
        let mut buf = vec![0u8; max_len as usize];
        self.read_data(section, offset, &mut buf)?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    pub fn read_cstring(&self, section: SectionId, offset: u64) -> Result<String, PatternError> {
        let mut out = Vec::new();
        let mut pos = offset;
        loop {
            let mut byte = [0u8; 1];
            self.read_data(section, pos, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            out.push(byte[0]);
            pos += 1;
            if out.len() > 1 << 20 {
                return Err(PatternError::eval("E_CSTRING_TOO_LONG", "C string exceeds 1MiB without a NUL terminator"));
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::CallbackSection;

    fn io_with_bytes(bytes: Vec<u8>) -> ByteIo {
        let mut io = ByteIo::new();
        let section = CallbackSection::new(
            0,
            bytes.len() as u64,
            move |offset, buf| {
                let offset = offset as usize;
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = bytes.get(offset + i).copied().unwrap_or(0);
                }
            },
            None,
        );
        io.sections_mut().set_main(section);
        io
    }

    #[test]
    fn read_bits_little_endian_extracts_window() {
        // 0b1010_0101, 0b0000_0001 little endian: bits [4, 12) should read 0b0001_1010
        let io = io_with_bytes(vec![0b1010_0101, 0b0000_0001]);
        let v = io.read_bits(crate::section::MAIN, 0, 4, 8, Endian::Little).unwrap();
        assert_eq!(v, 0b0001_1010);
    }

    #[test]
    fn write_bits_is_read_modify_write() {
        let mut io = ByteIo::new();
        io.allow_main_section_edits = true;
        io.sections_mut().set_main(CallbackSection::new(0, 4, |_, buf| buf.fill(0), Some(Box::new(|_, _| {}))));
        // CallbackSection's fixed no-op writer can't be observed; exercise
        // the heap section instead, which is always writable.
        io.write_bits(crate::section::HEAP, 0, 0, 8, Endian::Little, 0xAB).unwrap();
        let v = io.read_bits(crate::section::HEAP, 0, 0, 8, Endian::Little).unwrap();
        assert_eq!(v, 0xAB);
    }

    #[test]
    fn read_offset_and_increment_aligns_first() {
        let mut io = ByteIo::new();
        io.set_cursor(ReadCursor { byte: 4, bit: 3 });
        let offset = io.read_offset_and_increment(2);
        assert_eq!(offset, 5);
        assert_eq!(io.cursor(), ReadCursor { byte: 7, bit: 0 });
    }

    #[test]
    fn main_writes_rejected_without_opt_in() {
        let mut io = io_with_bytes(vec![0, 0, 0, 0]);
        let err = io.write_data(crate::section::MAIN, 0, &[1]).unwrap_err();
        assert_eq!(err.code, "E_MAIN_READONLY");
    }
}
