//! Bit-packed packet serialization to a stream file.
//!
//! A [`Ctfser`] buffers the packet being written and tracks a bit
//! cursor into it. Fields are written at their alignment in the
//! trace's byte order; the packet context can be rewritten in place
//! before the packet is closed and flushed to the file.

use crate::error::Error;
use byteordered::Endianness;
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug)]
pub(crate) struct Ctfser {
    file: File,
    endianness: Endianness,
    /// Buffered bytes of the packet currently being written.
    packet: Vec<u8>,
    /// Bit cursor within the current packet.
    offset_bits: u64,
}

impl Ctfser {
    pub fn new<P: AsRef<Path>>(path: P, endianness: Endianness) -> Result<Self, Error> {
        Ok(Self {
            file: File::create(path)?,
            endianness,
            packet: Vec::new(),
            offset_bits: 0,
        })
    }

    /// Begins a new packet at the current file offset.
    pub fn open_packet(&mut self) {
        self.packet.clear();
        self.offset_bits = 0;
    }

    pub fn offset_in_current_packet_bits(&self) -> u64 {
        self.offset_bits
    }

    /// Moves the bit cursor; used to rewrite the packet context once
    /// the packet's sizes and timestamps are known.
    pub fn set_offset_in_current_packet_bits(&mut self, offset_bits: u64) {
        self.offset_bits = offset_bits;
    }

    /// Advances the bit cursor to the next multiple of `alignment_bits`.
    pub fn align_to(&mut self, alignment_bits: u32) {
        let alignment_bits = u64::from(alignment_bits);
        let aligned = self.offset_bits.div_ceil(alignment_bits) * alignment_bits;
        tracing::trace!(
            align = alignment_bits,
            index = self.offset_bits,
            next_index = aligned,
        );
        self.offset_bits = aligned;
    }

    fn ensure_capacity(&mut self, end_bit: u64) {
        let bytes = end_bit.div_ceil(8) as usize;
        if self.packet.len() < bytes {
            self.packet.resize(bytes, 0);
        }
    }

    /// Writes the low `size_bits` bits of `value` at the cursor, after
    /// aligning to `alignment_bits`.
    pub fn write_unsigned(&mut self, value: u64, alignment_bits: u32, size_bits: u32) {
        debug_assert!(size_bits >= 1 && size_bits <= 64);
        self.align_to(alignment_bits);

        let value = if size_bits == 64 {
            value
        } else {
            value & ((1_u64 << size_bits) - 1)
        };

        let offset = self.offset_bits;
        self.ensure_capacity(offset + u64::from(size_bits));

        if offset % 8 == 0 && size_bits % 8 == 0 {
            // Whole bytes at a byte boundary
            let start = (offset / 8) as usize;
            let count = (size_bits / 8) as usize;
            match self.endianness {
                Endianness::Little => {
                    self.packet[start..start + count].copy_from_slice(&value.to_le_bytes()[..count]);
                }
                Endianness::Big => {
                    self.packet[start..start + count]
                        .copy_from_slice(&value.to_be_bytes()[8 - count..]);
                }
            }
        } else {
            for i in 0..u64::from(size_bits) {
                // Little endian packs LSB first; big endian packs MSB
                // first, filling each byte from its high bit down
                let (bit, byte_index, bit_index) = match self.endianness {
                    Endianness::Little => {
                        let pos = offset + i;
                        ((value >> i) & 1, (pos / 8) as usize, (pos % 8) as u32)
                    }
                    Endianness::Big => {
                        let pos = offset + i;
                        (
                            (value >> (u64::from(size_bits) - 1 - i)) & 1,
                            (pos / 8) as usize,
                            7 - (pos % 8) as u32,
                        )
                    }
                };

                if bit == 1 {
                    self.packet[byte_index] |= 1 << bit_index;
                } else {
                    self.packet[byte_index] &= !(1 << bit_index);
                }
            }
        }

        self.offset_bits = offset + u64::from(size_bits);
    }

    pub fn write_signed(&mut self, value: i64, alignment_bits: u32, size_bits: u32) {
        self.write_unsigned(value as u64, alignment_bits, size_bits);
    }

    /// Byte-aligned write; the common case for header and context
    /// members.
    pub fn write_byte_aligned_unsigned(&mut self, value: u64, size_bits: u32) {
        self.write_unsigned(value, 8, size_bits);
    }

    pub fn write_float32(&mut self, value: f32, alignment_bits: u32) {
        self.write_unsigned(u64::from(value.to_bits()), alignment_bits, 32);
    }

    pub fn write_float64(&mut self, value: f64, alignment_bits: u32) {
        self.write_unsigned(value.to_bits(), alignment_bits, 64);
    }

    /// Writes a null-terminated UTF-8 string at byte alignment.
    pub fn write_string(&mut self, value: &str) {
        self.align_to(8);
        let start = (self.offset_bits / 8) as usize;
        let bytes = value.as_bytes();
        self.ensure_capacity(self.offset_bits + 8 * (bytes.len() as u64 + 1));
        self.packet[start..start + bytes.len()].copy_from_slice(bytes);
        self.packet[start + bytes.len()] = 0;
        self.offset_bits += 8 * (bytes.len() as u64 + 1);
    }

    /// Pads the packet to `total_bytes`, writes it to the file, and
    /// resets for the next packet.
    pub fn close_current_packet(&mut self, total_bytes: u64) -> Result<(), Error> {
        debug_assert!(self.packet.len() as u64 <= total_bytes);
        self.packet.resize(total_bytes as usize, 0);
        self.file.write_all(&self.packet)?;
        self.packet.clear();
        self.offset_bits = 0;
        Ok(())
    }

    /// Flushes buffered file data; called when the stream closes.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.file.flush()?;
        Ok(())
    }
}
