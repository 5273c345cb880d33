use chrono::NaiveDateTime;

use super::{
    decode_date_time, decode_int, decode_string, decode_uint, float_from_raw, sfloat_from_raw,
    ByteOrder, CodecError, DATE_TIME_LEN,
};

/// Cursor over an attribute value.
///
/// The `get_*` methods consume from the current offset and advance it only
/// on success; the `*_at` methods read at an explicit offset and leave the
/// cursor alone.
#[derive(Debug, Clone)]
pub struct BytesParser<'a> {
    bytes: &'a [u8],
    offset: usize,
    order: ByteOrder,
}

impl<'a> BytesParser<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self::with_order(bytes, ByteOrder::LittleEndian)
    }

    pub fn with_order(bytes: &'a [u8], order: ByteOrder) -> Self {
        Self { bytes, offset: 0, order }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }

    pub fn uint_at(&self, offset: usize, width: usize) -> Result<u64, CodecError> {
        decode_uint(self.bytes, offset, width, self.order)
    }

    pub fn int_at(&self, offset: usize, width: usize) -> Result<i64, CodecError> {
        decode_int(self.bytes, offset, width, self.order)
    }

    pub fn sfloat_at(&self, offset: usize) -> Result<f64, CodecError> {
        Ok(sfloat_from_raw(self.uint_at(offset, 2)? as u16))
    }

    pub fn float_at(&self, offset: usize) -> Result<f64, CodecError> {
        Ok(float_from_raw(self.uint_at(offset, 4)? as u32))
    }

    pub fn date_time_at(&self, offset: usize) -> Result<NaiveDateTime, CodecError> {
        decode_date_time(self.bytes, offset, self.order)
    }

    fn advance<T>(&mut self, width: usize, value: Result<T, CodecError>) -> Result<T, CodecError> {
        let value = value?;
        self.offset += width;
        Ok(value)
    }

    pub fn get_uint(&mut self, width: usize) -> Result<u64, CodecError> {
        let value = self.uint_at(self.offset, width);
        self.advance(width, value)
    }

    pub fn get_int(&mut self, width: usize) -> Result<i64, CodecError> {
        let value = self.int_at(self.offset, width);
        self.advance(width, value)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.get_uint(1)? as u8)
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        Ok(self.get_uint(2)? as u16)
    }

    pub fn get_u24(&mut self) -> Result<u32, CodecError> {
        Ok(self.get_uint(3)? as u32)
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.get_uint(4)? as u32)
    }

    pub fn get_u48(&mut self) -> Result<u64, CodecError> {
        self.get_uint(6)
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        self.get_uint(8)
    }

    pub fn get_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.get_int(1)? as i8)
    }

    pub fn get_i16(&mut self) -> Result<i16, CodecError> {
        Ok(self.get_int(2)? as i16)
    }

    pub fn get_i24(&mut self) -> Result<i32, CodecError> {
        Ok(self.get_int(3)? as i32)
    }

    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.get_int(4)? as i32)
    }

    pub fn get_i48(&mut self) -> Result<i64, CodecError> {
        self.get_int(6)
    }

    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        self.get_int(8)
    }

    pub fn get_sfloat(&mut self) -> Result<f64, CodecError> {
        let value = self.sfloat_at(self.offset);
        self.advance(2, value)
    }

    pub fn get_float(&mut self) -> Result<f64, CodecError> {
        let value = self.float_at(self.offset);
        self.advance(4, value)
    }

    pub fn get_date_time(&mut self) -> Result<NaiveDateTime, CodecError> {
        let value = self.date_time_at(self.offset);
        self.advance(DATE_TIME_LEN, value)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let bytes = self.bytes;
        let start = self.offset;
        let chunk = start
            .checked_add(len)
            .and_then(|end| bytes.get(start..end))
            .ok_or(CodecError::Truncated {
                offset: start,
                needed: len,
                available: self.remaining(),
            })?;
        self.offset += len;
        Ok(chunk)
    }

    /// Latin-1 text from the cursor to the first NUL; consumes the rest of the buffer.
    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let text = decode_string(self.bytes, self.offset)?;
        self.offset = self.bytes.len();
        Ok(text)
    }
}
