/// A raw encoder appending to a byte buffer.
#[derive(Debug)]
pub struct Encoder<'a> {
    buffer: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    /// Creates an encoder that will append to the provided
    /// byte buffer.
    ///
    /// Any existing contents of `buffer` are left untouched.
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self { buffer }
    }

    pub fn write_u8(&mut self, x: u8) {
        self.buffer.push(x);
    }

    pub fn write_i8(&mut self, x: i8) {
        self.write_u8(bytemuck::cast(x));
    }

    /// Writes a big-endian unsigned short.
    pub fn write_u16(&mut self, x: u16) {
        self.buffer.extend(x.to_be_bytes());
    }

    pub fn write_u16_le(&mut self, x: u16) {
        self.buffer.extend(x.to_le_bytes());
    }

    pub fn write_i16_le(&mut self, x: i16) {
        self.buffer.extend(x.to_le_bytes());
    }

    /// Writes the low 24 bits of `x`, little-endian.
    pub fn write_u24_le(&mut self, x: u32) {
        self.buffer.extend_from_slice(&x.to_le_bytes()[..3]);
    }

    /// Writes a big-endian unsigned int.
    pub fn write_u32(&mut self, x: u32) {
        self.buffer.extend(x.to_be_bytes());
    }

    pub fn write_u32_le(&mut self, x: u32) {
        self.buffer.extend(x.to_le_bytes());
    }

    /// Writes a big-endian signed int.
    pub fn write_i32(&mut self, x: i32) {
        self.buffer.extend(x.to_be_bytes());
    }

    pub fn write_i32_le(&mut self, x: i32) {
        self.buffer.extend(x.to_le_bytes());
    }

    /// Writes a big-endian unsigned long.
    pub fn write_u64(&mut self, x: u64) {
        self.buffer.extend(x.to_be_bytes());
    }

    pub fn write_u64_le(&mut self, x: u64) {
        self.buffer.extend(x.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, x: i64) {
        self.buffer.extend(x.to_le_bytes());
    }

    pub fn write_f32_le(&mut self, x: f32) {
        self.buffer.extend(x.to_le_bytes());
    }

    pub fn write_bool(&mut self, x: bool) {
        self.write_u8(if x { 0x01 } else { 0x00 });
    }

    /// Writes a series of bytes to the stream. Does not write
    /// any sort of length prefix.
    pub fn write_slice(&mut self, slice: &[u8]) {
        self.buffer.extend_from_slice(slice);
    }

    /// Writes an unsigned LEB128 value. Returns the number of bytes written.
    pub fn write_var_uint(&mut self, x: u32) -> usize {
        self.write_var_ulong(u64::from(x))
    }

    /// Writes an unsigned LEB128 value. Returns the number of bytes written.
    pub fn write_var_ulong(&mut self, mut x: u64) -> usize {
        let mut bytes_written = 0;
        loop {
            let mut temp = (x & 0b0111_1111) as u8;
            x >>= 7;
            if x != 0 {
                temp |= 0b1000_0000;
            }

            self.buffer.push(temp);
            bytes_written += 1;

            if x == 0 {
                break bytes_written;
            }
        }
    }

    /// Writes a zig-zag encoded 32-bit integer.
    pub fn write_var_int(&mut self, x: i32) -> usize {
        self.write_var_uint(((x << 1) ^ (x >> 31)) as u32)
    }

    /// Writes a zig-zag encoded 64-bit integer.
    pub fn write_var_long(&mut self, x: i64) -> usize {
        self.write_var_ulong(((x << 1) ^ (x >> 63)) as u64)
    }

    /// Writes a varuint-prefixed byte array.
    pub fn write_byte_array(&mut self, x: &[u8]) {
        self.write_var_uint(x.len().try_into().unwrap_or(u32::MAX));
        self.buffer.extend_from_slice(x);
    }

    /// Writes a varuint-prefixed string.
    pub fn write_string(&mut self, x: &str) {
        self.write_byte_array(x.as_bytes());
    }
}

/// A type that can be written to an [`Encoder`].
///
/// Fixed-width integers are encoded little-endian, matching game packet
/// bodies.
pub trait Encode {
    fn encode(&self, encoder: &mut Encoder);
}

macro_rules! encode_with {
    ($($ty:ty => $write:ident),* $(,)?) => {
        $(impl Encode for $ty {
            fn encode(&self, encoder: &mut Encoder) {
                encoder.$write(*self);
            }
        })*
    };
}

encode_with! {
    u8 => write_u8,
    i8 => write_i8,
    u16 => write_u16_le,
    i16 => write_i16_le,
    u32 => write_u32_le,
    i32 => write_i32_le,
    u64 => write_u64_le,
    i64 => write_i64_le,
    f32 => write_f32_le,
    bool => write_bool,
}

impl Encode for String {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_string(self);
    }
}

impl Encode for bytes::Bytes {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_byte_array(self);
    }
}

impl Encode for uuid::Uuid {
    fn encode(&self, encoder: &mut Encoder) {
        let (high, low) = self.as_u64_pair();
        encoder.write_u64_le(high);
        encoder.write_u64_le(low);
    }
}

impl Encode for () {
    fn encode(&self, _encoder: &mut Encoder) {}
}

/// Size in bytes of `x` as an unsigned varint.
pub fn var_uint_size(x: u32) -> usize {
    Encoder::new(&mut Vec::new()).write_var_uint(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Decoder;

    #[test]
    fn zigzag_matches_reference_values() {
        let mut buf = Vec::new();
        let mut encoder = Encoder::new(&mut buf);
        encoder.write_var_int(-1);
        encoder.write_var_int(1);
        encoder.write_var_int(i32::MIN);
        assert_eq!(&buf[..2], &[0x01, 0x02]);

        let mut decoder = Decoder::new(&buf);
        assert_eq!(decoder.read_var_int().unwrap(), -1);
        assert_eq!(decoder.read_var_int().unwrap(), 1);
        assert_eq!(decoder.read_var_int().unwrap(), i32::MIN);
    }

    #[test]
    fn var_uint_size_boundaries() {
        assert_eq!(var_uint_size(0), 1);
        assert_eq!(var_uint_size(127), 1);
        assert_eq!(var_uint_size(128), 2);
        assert_eq!(var_uint_size(u32::MAX), 5);
    }

    #[test]
    fn triad_drops_high_byte() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf).write_u24_le(0x0102_0304);
        assert_eq!(buf, [0x04, 0x03, 0x02]);
    }
}
