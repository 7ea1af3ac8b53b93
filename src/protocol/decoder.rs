use std::{convert::Infallible, num::TryFromIntError, str::Utf8Error};

/// An error while decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("need at least {0} more bytes")]
    EndOfStream(usize),
    #[error("invalid boolean pattern {0} - expected either 0 or 1")]
    InvalidBool(u8),
    #[error("varint / varlong is too long")]
    VarIntTooLong,
    #[error("string of {0} bytes exceeds max allowed length")]
    StringTooLong(usize),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    IntConversion(#[from] TryFromIntError),
    /// Special variant for derive macro integer conversions to work.
    /// Cannot occur.
    #[error(transparent)]
    Infallible(#[from] Infallible),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

/// Login tokens and form payloads travel as strings, so this is far above
/// what a chat message would need.
const MAX_STRING_LENGTH: usize = 1024 * 1024;

/// A raw decoder over a byte buffer.
///
/// RakNet framing is mostly big-endian, game packets mostly little-endian;
/// both families of readers live here.
#[derive(Debug)]
pub struct Decoder<'a> {
    buffer: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder from the buffer it will read from.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    /// Gets the remaining buffer.
    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    /// Returns if there is no data left in the buffer.
    pub fn is_finished(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consumes `n` bytes from the buffer, returning them as a slice.
    pub fn consume_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if n <= self.buffer.len() {
            let (data, buffer) = self.buffer.split_at(n);
            self.buffer = buffer;
            Ok(data)
        } else {
            Err(DecodeError::EndOfStream(n - self.buffer.len()))
        }
    }

    /// Consumes everything left in the buffer.
    pub fn consume_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buffer)
    }

    /// Consumes `N` bytes into an array.
    pub fn consume<const N: usize>(&mut self) -> Result<[u8; N]> {
        let data = self.consume_slice(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(data);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.consume::<1>().map(|[x]| x)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.consume().map(i8::from_be_bytes)
    }

    /// Reads a big-endian unsigned short.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.consume().map(u16::from_be_bytes)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        self.consume().map(u16::from_le_bytes)
    }

    pub fn read_i16_le(&mut self) -> Result<i16> {
        self.consume().map(i16::from_le_bytes)
    }

    /// Reads a little-endian 24-bit unsigned integer (a RakNet "triad").
    pub fn read_u24_le(&mut self) -> Result<u32> {
        let [a, b, c] = self.consume::<3>()?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }

    /// Reads a big-endian unsigned int.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.consume().map(u32::from_be_bytes)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.consume().map(u32::from_le_bytes)
    }

    /// Reads a big-endian signed int.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.consume().map(i32::from_be_bytes)
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        self.consume().map(i32::from_le_bytes)
    }

    /// Reads a big-endian unsigned long.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.consume().map(u64::from_be_bytes)
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        self.consume().map(u64::from_le_bytes)
    }

    pub fn read_i64_le(&mut self) -> Result<i64> {
        self.consume().map(i64::from_le_bytes)
    }

    pub fn read_f32_le(&mut self) -> Result<f32> {
        self.consume().map(f32::from_le_bytes)
    }

    /// Reads a boolean from the stream.
    pub fn read_bool(&mut self) -> Result<bool> {
        let x = self.read_u8()?;
        match x {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidBool(x)),
        }
    }

    /// Reads an unsigned LEB128 value of at most 32 bits.
    pub fn read_var_uint(&mut self) -> Result<u32> {
        let value = self.read_leb128(5)?;
        u32::try_from(value).map_err(|_| DecodeError::VarIntTooLong)
    }

    /// Reads an unsigned LEB128 value of at most 64 bits.
    pub fn read_var_ulong(&mut self) -> Result<u64> {
        self.read_leb128(10)
    }

    /// Reads a zig-zag encoded 32-bit integer.
    pub fn read_var_int(&mut self) -> Result<i32> {
        let raw = self.read_var_uint()?;
        Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
    }

    /// Reads a zig-zag encoded 64-bit integer.
    pub fn read_var_long(&mut self) -> Result<i64> {
        let raw = self.read_var_ulong()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    fn read_leb128(&mut self, max_bytes: u32) -> Result<u64> {
        let mut result = 0u64;
        for num_read in 0..max_bytes {
            let read = self.read_u8()?;
            result |= u64::from(read & 0b0111_1111) << (7 * num_read);
            if read & 0b1000_0000 == 0 {
                return Ok(result);
            }
        }
        Err(DecodeError::VarIntTooLong)
    }

    /// Reads a varuint-prefixed byte array.
    pub fn read_byte_array(&mut self) -> Result<&'a [u8]> {
        let length = usize::try_from(self.read_var_uint()?)?;
        self.consume_slice(length)
    }

    /// Reads a varuint-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<&'a str> {
        let length = usize::try_from(self.read_var_uint()?)?;
        if length > MAX_STRING_LENGTH {
            return Err(DecodeError::StringTooLong(length));
        }
        let string = std::str::from_utf8(self.consume_slice(length)?)?;
        Ok(string)
    }
}

/// A type that can be read from a [`Decoder`].
///
/// Fixed-width integers are decoded little-endian, matching game packet
/// bodies.
pub trait Decode: Sized {
    fn decode(decoder: &mut Decoder) -> Result<Self>;
}

macro_rules! decode_with {
    ($($ty:ty => $read:ident),* $(,)?) => {
        $(impl Decode for $ty {
            fn decode(decoder: &mut Decoder) -> Result<Self> {
                decoder.$read()
            }
        })*
    };
}

decode_with! {
    u8 => read_u8,
    i8 => read_i8,
    u16 => read_u16_le,
    i16 => read_i16_le,
    u32 => read_u32_le,
    i32 => read_i32_le,
    u64 => read_u64_le,
    i64 => read_i64_le,
    f32 => read_f32_le,
    bool => read_bool,
}

impl Decode for String {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_string().map(str::to_owned)
    }
}

/// Varuint-prefixed byte array.
impl Decode for bytes::Bytes {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_byte_array().map(bytes::Bytes::copy_from_slice)
    }
}

/// UUIDs are written as two little-endian u64 halves, most significant first.
impl Decode for uuid::Uuid {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        let high = decoder.read_u64_le()?;
        let low = decoder.read_u64_le()?;
        Ok(uuid::Uuid::from_u64_pair(high, low))
    }
}

impl Decode for () {
    fn decode(_decoder: &mut Decoder) -> Result<Self> {
        Ok(())
    }
}
