//! Bit-exact value codec for attribute payloads
//!
//! Fixed-width integers (8/16/24/32/48/64 bits, signed or unsigned, either
//! byte order), the IEEE-11073 SFLOAT and FLOAT layouts, and the 7-byte
//! date-time. Decoding from a short buffer is always an error.

pub mod builder;
pub mod parser;

pub use builder::BytesBuilder;
pub use parser::BytesParser;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Truncated input: need {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Value {value} does not fit in {kind}")]
    ValueOutOfRange { kind: &'static str, value: String },

    #[error("Invalid date-time")]
    InvalidDateTime,

    #[error("Unsupported integer width: {0} bytes")]
    UnsupportedWidth(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

pub const DATE_TIME_LEN: usize = 7;

const SUPPORTED_WIDTHS: [usize; 6] = [1, 2, 3, 4, 6, 8];

fn check_width(width: usize) -> Result<(), CodecError> {
    if SUPPORTED_WIDTHS.contains(&width) {
        Ok(())
    } else {
        Err(CodecError::UnsupportedWidth(width))
    }
}

fn slice(bytes: &[u8], offset: usize, needed: usize) -> Result<&[u8], CodecError> {
    offset
        .checked_add(needed)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(CodecError::Truncated {
            offset,
            needed,
            available: bytes.len().saturating_sub(offset),
        })
}

/// Decode an unsigned integer of `width` bytes.
pub fn decode_uint(
    bytes: &[u8],
    offset: usize,
    width: usize,
    order: ByteOrder,
) -> Result<u64, CodecError> {
    check_width(width)?;
    let raw = slice(bytes, offset, width)?;
    let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
    Ok(match order {
        ByteOrder::LittleEndian => raw.iter().rev().fold(0, fold),
        ByteOrder::BigEndian => raw.iter().fold(0, fold),
    })
}

/// Decode a two's-complement integer of `width` bytes.
pub fn decode_int(
    bytes: &[u8],
    offset: usize,
    width: usize,
    order: ByteOrder,
) -> Result<i64, CodecError> {
    let raw = decode_uint(bytes, offset, width, order)?;
    let shift = 64 - 8 * width as u32;
    Ok(((raw << shift) as i64) >> shift)
}

/// Encode an unsigned integer into `width` bytes.
pub fn encode_uint(value: u64, width: usize, order: ByteOrder) -> Result<Vec<u8>, CodecError> {
    check_width(width)?;
    if width < 8 && value >> (8 * width) != 0 {
        return Err(CodecError::ValueOutOfRange {
            kind: uint_kind(width),
            value: value.to_string(),
        });
    }
    Ok(to_bytes(value, width, order))
}

/// Encode a signed integer into `width` bytes.
pub fn encode_int(value: i64, width: usize, order: ByteOrder) -> Result<Vec<u8>, CodecError> {
    check_width(width)?;
    if width < 8 {
        let bits = 8 * width as u32;
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if value < min || value > max {
            return Err(CodecError::ValueOutOfRange {
                kind: int_kind(width),
                value: value.to_string(),
            });
        }
    }
    Ok(to_bytes(value as u64, width, order))
}

fn to_bytes(value: u64, width: usize, order: ByteOrder) -> Vec<u8> {
    let le = value.to_le_bytes();
    let mut out = le[..width].to_vec();
    if order == ByteOrder::BigEndian {
        out.reverse();
    }
    out
}

fn uint_kind(width: usize) -> &'static str {
    match width {
        1 => "uint8",
        2 => "uint16",
        3 => "uint24",
        4 => "uint32",
        6 => "uint48",
        _ => "uint64",
    }
}

fn int_kind(width: usize) -> &'static str {
    match width {
        1 => "int8",
        2 => "int16",
        3 => "int24",
        4 => "int32",
        6 => "int48",
        _ => "int64",
    }
}

fn sign_extend(raw: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((raw << shift) as i32) >> shift
}

fn apply_exponent(mantissa: i32, exponent: i32) -> f64 {
    // Divide for negative exponents so that e.g. 366e-1 lands on 36.6 exactly.
    if exponent < 0 {
        f64::from(mantissa) / 10f64.powi(-exponent)
    } else {
        f64::from(mantissa) * 10f64.powi(exponent)
    }
}

/// 16-bit SFLOAT: 4-bit exponent, 12-bit mantissa.
pub fn sfloat_from_raw(raw: u16) -> f64 {
    let mantissa = sign_extend(u32::from(raw & 0x0FFF), 12);
    let exponent = sign_extend(u32::from(raw >> 12), 4);
    apply_exponent(mantissa, exponent)
}

/// 32-bit FLOAT: 8-bit exponent, 24-bit mantissa.
pub fn float_from_raw(raw: u32) -> f64 {
    let mantissa = sign_extend(raw & 0x00FF_FFFF, 24);
    let exponent = sign_extend(raw >> 24, 8);
    apply_exponent(mantissa, exponent)
}

fn mantissa_for(value: f64, precision: i8, bits: u32, kind: &'static str) -> Result<i32, CodecError> {
    let out_of_range = || CodecError::ValueOutOfRange {
        kind,
        value: format!("{value} (precision {precision})"),
    };
    let scaled = (value * 10f64.powi(i32::from(precision))).round();
    let limit = f64::from(1u32 << (bits - 1));
    if !scaled.is_finite() || scaled < -limit || scaled >= limit {
        return Err(out_of_range());
    }
    Ok(scaled as i32)
}

/// Encode `value` with `precision` decimal places as SFLOAT.
pub fn sfloat_to_raw(value: f64, precision: i8) -> Result<u16, CodecError> {
    if !(-7..=8).contains(&precision) {
        return Err(CodecError::ValueOutOfRange {
            kind: "sfloat exponent",
            value: (-i16::from(precision)).to_string(),
        });
    }
    let mantissa = mantissa_for(value, precision, 12, "sfloat")?;
    let exponent = -i32::from(precision);
    Ok((((exponent & 0x0F) << 12) | (mantissa & 0x0FFF)) as u16)
}

/// Encode `value` with `precision` decimal places as FLOAT.
pub fn float_to_raw(value: f64, precision: i8) -> Result<u32, CodecError> {
    if precision == i8::MIN {
        return Err(CodecError::ValueOutOfRange {
            kind: "float exponent",
            value: "128".to_string(),
        });
    }
    let mantissa = mantissa_for(value, precision, 24, "float")?;
    let exponent = -i32::from(precision);
    Ok((((exponent & 0xFF) << 24) | (mantissa & 0x00FF_FFFF)) as u32)
}

/// Decode the 7-byte date-time layout.
pub fn decode_date_time(
    bytes: &[u8],
    offset: usize,
    order: ByteOrder,
) -> Result<NaiveDateTime, CodecError> {
    let raw = slice(bytes, offset, DATE_TIME_LEN)?;
    let year = decode_uint(raw, 0, 2, order)? as i32;
    NaiveDate::from_ymd_opt(year, u32::from(raw[2]), u32::from(raw[3]))
        .and_then(|d| d.and_hms_opt(u32::from(raw[4]), u32::from(raw[5]), u32::from(raw[6])))
        .ok_or(CodecError::InvalidDateTime)
}

/// Encode the 7-byte date-time layout.
pub fn encode_date_time(value: &NaiveDateTime, order: ByteOrder) -> Result<Vec<u8>, CodecError> {
    let year = u64::try_from(value.year()).map_err(|_| CodecError::InvalidDateTime)?;
    let mut out = encode_uint(year, 2, order).map_err(|_| CodecError::InvalidDateTime)?;
    out.extend_from_slice(&[
        value.month() as u8,
        value.day() as u8,
        value.hour() as u8,
        value.minute() as u8,
        value.second() as u8,
    ]);
    Ok(out)
}

/// Latin-1 text up to the first NUL or the end of the buffer.
pub fn decode_string(bytes: &[u8], offset: usize) -> Result<String, CodecError> {
    let raw = slice(bytes, offset, bytes.len().saturating_sub(offset))?;
    Ok(raw
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| char::from(*b))
        .collect())
}

/// Upper-case hex rendering used in logs.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn order(big: bool) -> ByteOrder {
        if big {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }

    #[test]
    fn test_integer_widths_both_orders() {
        let cases: [(usize, u64, i64); 6] = [
            (1, 0xFE, -2),
            (2, 0xFFFE, -2),
            (3, 0x12_3456, -8_388_608),
            (4, 0xDEAD_BEEF, i64::from(i32::MIN)),
            (6, 0xFFFF_FFFF_FFFF, -1),
            (8, u64::MAX, i64::MIN),
        ];
        for (width, unsigned, signed) in cases {
            for order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
                let bytes = encode_uint(unsigned, width, order).unwrap();
                assert_eq!(bytes.len(), width);
                assert_eq!(decode_uint(&bytes, 0, width, order).unwrap(), unsigned);

                let bytes = encode_int(signed, width, order).unwrap();
                assert_eq!(decode_int(&bytes, 0, width, order).unwrap(), signed);
            }
        }
    }

    #[test]
    fn test_byte_order_layout() {
        assert_eq!(encode_uint(0x1234, 2, ByteOrder::LittleEndian).unwrap(), vec![0x34, 0x12]);
        assert_eq!(encode_uint(0x1234, 2, ByteOrder::BigEndian).unwrap(), vec![0x12, 0x34]);
        assert_eq!(encode_int(-1, 3, ByteOrder::BigEndian).unwrap(), vec![0xFF, 0xFF, 0xFF]);
        assert_eq!(decode_int(&[0x00, 0x00, 0x80], 0, 3, ByteOrder::LittleEndian).unwrap(), -8_388_608);
    }

    #[test]
    fn test_out_of_range_and_bad_width() {
        assert!(matches!(
            encode_uint(0x100_0000, 3, ByteOrder::LittleEndian),
            Err(CodecError::ValueOutOfRange { kind: "uint24", .. })
        ));
        assert!(encode_int(128, 1, ByteOrder::LittleEndian).is_err());
        assert!(encode_int(-129, 1, ByteOrder::LittleEndian).is_err());
        assert_eq!(
            decode_uint(&[0; 8], 0, 5, ByteOrder::LittleEndian),
            Err(CodecError::UnsupportedWidth(5))
        );
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        assert_eq!(
            decode_uint(&[0x01, 0x02, 0x03], 1, 4, ByteOrder::LittleEndian),
            Err(CodecError::Truncated { offset: 1, needed: 4, available: 2 })
        );
        assert!(decode_uint(&[0x01], 5, 1, ByteOrder::LittleEndian).is_err());
        assert!(decode_date_time(&[0xE4, 0x07, 1, 1, 0, 0], 0, ByteOrder::LittleEndian).is_err());
    }

    #[test]
    fn test_sfloat_known_values() {
        let raw = sfloat_to_raw(36.6, 1).unwrap();
        assert_eq!(raw, 0xF16E);
        assert_eq!(sfloat_from_raw(raw), 36.6);

        let raw = sfloat_to_raw(-5.25, 2).unwrap();
        assert!((sfloat_from_raw(raw) + 5.25).abs() < 1e-9);

        // Positive exponent.
        assert_eq!(sfloat_from_raw(0x2001), 100.0);
        // 12-bit mantissa tops out at 2047.
        assert!(sfloat_to_raw(204.8, 1).is_err());
    }

    #[test]
    fn test_float_known_values() {
        let raw = float_to_raw(36.6, 1).unwrap();
        assert_eq!(raw, 0xFF00_016E);
        assert_eq!(float_from_raw(raw), 36.6);

        let raw = float_to_raw(-1234.567, 3).unwrap();
        assert!((float_from_raw(raw) + 1234.567).abs() < 1e-9);
        assert!(float_to_raw(10_000_000.0, 0).is_err());
    }

    #[test]
    fn test_date_time_layout() {
        let bytes = [0xE4, 0x07, 12, 31, 23, 59, 58];
        let dt = decode_date_time(&bytes, 0, ByteOrder::LittleEndian).unwrap();
        assert_eq!(dt.to_string(), "2020-12-31 23:59:58");
        assert_eq!(encode_date_time(&dt, ByteOrder::LittleEndian).unwrap(), bytes.to_vec());

        let bad_month = [0xE4, 0x07, 13, 1, 0, 0, 0];
        assert_eq!(
            decode_date_time(&bad_month, 0, ByteOrder::LittleEndian),
            Err(CodecError::InvalidDateTime)
        );
    }

    #[test]
    fn test_string_stops_at_nul() {
        assert_eq!(decode_string(b"H10\0junk", 0).unwrap(), "H10");
        assert_eq!(decode_string(&[0x41, 0xE9], 0).unwrap(), "A\u{e9}");
        assert_eq!(decode_string(b"abc", 3).unwrap(), "");
        assert!(decode_string(b"abc", 4).is_err());
    }

    proptest! {
        #[test]
        fn test_uint_round_trip(
            width in prop::sample::select(SUPPORTED_WIDTHS.to_vec()),
            raw in any::<u64>(),
            big in any::<bool>(),
        ) {
            let value = if width == 8 { raw } else { raw & ((1u64 << (8 * width)) - 1) };
            let bytes = encode_uint(value, width, order(big)).unwrap();
            prop_assert_eq!(bytes.len(), width);
            prop_assert_eq!(decode_uint(&bytes, 0, width, order(big)).unwrap(), value);
        }

        #[test]
        fn test_int_round_trip(
            width in prop::sample::select(SUPPORTED_WIDTHS.to_vec()),
            raw in any::<i64>(),
            big in any::<bool>(),
        ) {
            let shift = 64 - 8 * width as u32;
            let value = (raw << shift) >> shift;
            let bytes = encode_int(value, width, order(big)).unwrap();
            prop_assert_eq!(decode_int(&bytes, 0, width, order(big)).unwrap(), value);
        }

        // Reserved mantissas (NaN, NRes, infinities) are left out.
        #[test]
        fn test_sfloat_round_trip(mantissa in -2045i32..=2045, precision in -7i8..=8) {
            let raw = (((-i32::from(precision) & 0x0F) << 12) | (mantissa & 0x0FFF)) as u16;
            prop_assert_eq!(sfloat_to_raw(sfloat_from_raw(raw), precision).unwrap(), raw);
        }

        #[test]
        fn test_float_round_trip(mantissa in -8_388_605i32..=8_388_605, precision in -20i8..=20) {
            let raw = (((-i32::from(precision) & 0xFF) << 24) | (mantissa & 0x00FF_FFFF)) as u32;
            prop_assert_eq!(float_to_raw(float_from_raw(raw), precision).unwrap(), raw);
        }
    }
}
