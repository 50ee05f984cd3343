//! Bit-level primitives for USB bus packets
//!
//! USB transmits fields LSB-first, while the CRC5 below is defined MSB-first
//! over an arbitrary field width, so token construction reverses the field,
//! runs the CRC, and reverses the 5-bit remainder back.
//!
//! CRC16 covers data packet payloads and is table-driven via the `crc` crate.

use crc::{CRC_16_USB, Crc};

const CRC16_USB: Crc<u16> = Crc::<u16>::new(&CRC_16_USB);

/// Reverse the low `nbits` bits of `value`
///
/// Bits above `nbits` are ignored; widths above 32 are treated as 32.
///
/// # Example
/// ```
/// use protocol::bits::bit_reverse;
///
/// assert_eq!(bit_reverse(0b0001, 4), 0b1000);
/// assert_eq!(bit_reverse(0b110, 3), 0b011);
/// ```
pub fn bit_reverse(value: u32, nbits: u32) -> u32 {
    let nbits = nbits.min(u32::BITS);
    (0..nbits).fold(0, |acc, i| {
        let bit = (value >> (nbits - i - 1)) & 1;
        acc | (bit << i)
    })
}

/// Bit-serial CRC5 over the low `nbits` bits of `value`
///
/// The generator polynomial (0x05) and the all-ones seed are aligned to the
/// top of an `nbits`-wide register, the value is shifted through MSB-first,
/// and the remainder is inverted and brought back down to 5 bits.
///
/// # Panics
/// Panics if `nbits < 5`, `nbits > 32`, or `value` does not fit in `nbits` bits.
pub fn crc5(value: u32, nbits: u32) -> u8 {
    assert!((5..=32).contains(&nbits), "crc5 width out of range: {nbits}");
    assert!(
        nbits == 32 || value >> nbits == 0,
        "crc5 input {value:#x} does not fit in {nbits} bits"
    );

    let shift = nbits - 5;
    let mask: u64 = (1u64 << nbits) - 1;
    let top_bit: u64 = 1u64 << (nbits - 1);
    let poly: u64 = 0x05 << shift;

    let mut crc: u64 = 0x1F << shift;
    let mut val = value as u64;

    for _ in 0..nbits {
        let feedback = (val ^ crc) & top_bit != 0;
        crc = (crc << 1) & mask;
        if feedback {
            crc ^= poly;
        }
        val = (val << 1) & mask;
    }

    ((crc >> shift) as u8) ^ 0x1F
}

/// USB CRC16 of a data packet payload, as the two bytes sent on the wire
/// (little-endian)
pub fn crc16(bytes: &[u8]) -> [u8; 2] {
    CRC16_USB.checksum(bytes).to_le_bytes()
}
