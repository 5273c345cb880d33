use chrono::NaiveDateTime;

use super::{encode_date_time, encode_int, encode_uint, float_to_raw, sfloat_to_raw, ByteOrder, CodecError};

/// Growable builder for attribute values.
///
/// Native-width values are appended infallibly. Widths without a native
/// Rust type (24 and 48 bits) and the float layouts are range-checked.
#[derive(Debug, Clone, Default)]
pub struct BytesBuilder {
    bytes: Vec<u8>,
    order: ByteOrder,
}

impl BytesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(order: ByteOrder) -> Self {
        Self { bytes: Vec::new(), order }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn build(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    fn push_uint(&mut self, value: u64, width: usize) -> Result<&mut Self, CodecError> {
        let encoded = encode_uint(value, width, self.order)?;
        Ok(self.append(&encoded))
    }

    fn push_int(&mut self, value: i64, width: usize) -> Result<&mut Self, CodecError> {
        let encoded = encode_int(value, width, self.order)?;
        Ok(self.append(&encoded))
    }

    fn push_native(&mut self, le: &[u8]) -> &mut Self {
        match self.order {
            ByteOrder::LittleEndian => self.append(le),
            ByteOrder::BigEndian => {
                let mut be = le.to_vec();
                be.reverse();
                self.append(&be)
            }
        }
    }

    pub fn add_u8(&mut self, value: u8) -> &mut Self {
        self.append(&[value])
    }

    pub fn add_i8(&mut self, value: i8) -> &mut Self {
        self.append(&value.to_le_bytes())
    }

    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        self.push_native(&value.to_le_bytes())
    }

    pub fn add_i16(&mut self, value: i16) -> &mut Self {
        self.push_native(&value.to_le_bytes())
    }

    pub fn add_u24(&mut self, value: u32) -> Result<&mut Self, CodecError> {
        self.push_uint(u64::from(value), 3)
    }

    pub fn add_i24(&mut self, value: i32) -> Result<&mut Self, CodecError> {
        self.push_int(i64::from(value), 3)
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.push_native(&value.to_le_bytes())
    }

    pub fn add_i32(&mut self, value: i32) -> &mut Self {
        self.push_native(&value.to_le_bytes())
    }

    pub fn add_u48(&mut self, value: u64) -> Result<&mut Self, CodecError> {
        self.push_uint(value, 6)
    }

    pub fn add_i48(&mut self, value: i64) -> Result<&mut Self, CodecError> {
        self.push_int(value, 6)
    }

    pub fn add_u64(&mut self, value: u64) -> &mut Self {
        self.push_native(&value.to_le_bytes())
    }

    pub fn add_i64(&mut self, value: i64) -> &mut Self {
        self.push_native(&value.to_le_bytes())
    }

    /// SFLOAT with `precision` decimal places.
    pub fn add_sfloat(&mut self, value: f64, precision: i8) -> Result<&mut Self, CodecError> {
        let raw = sfloat_to_raw(value, precision)?;
        Ok(self.add_u16(raw))
    }

    /// FLOAT with `precision` decimal places.
    pub fn add_float(&mut self, value: f64, precision: i8) -> Result<&mut Self, CodecError> {
        let raw = float_to_raw(value, precision)?;
        Ok(self.add_u32(raw))
    }

    pub fn add_date_time(&mut self, value: &NaiveDateTime) -> Result<&mut Self, CodecError> {
        let encoded = encode_date_time(value, self.order)?;
        Ok(self.append(&encoded))
    }
}
