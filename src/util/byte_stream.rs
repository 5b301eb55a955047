use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crate::util::safe_converter::PrecheckedCast;

/// Settings that influence how NEX primitive types are laid out on the wire. They differ between
///  the title families: older titles use 4 byte PIDs, Switch titles use 8 byte PIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteStreamSettings {
    /// size of the length prefix for strings, 2 or 4 bytes
    pub string_length_size: usize,
    /// size of a serialized PID, 4 or 8 bytes
    pub pid_size: usize,
    pub use_structure_header: bool,
}
impl Default for ByteStreamSettings {
    fn default() -> Self {
        ByteStreamSettings {
            string_length_size: 2,
            pid_size: 4,
            use_structure_header: false,
        }
    }
}
impl ByteStreamSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.string_length_size, 2 | 4) {
            bail!("string length size must be 2 or 4, is {}", self.string_length_size);
        }
        if !matches!(self.pid_size, 4 | 8) {
            bail!("PID size must be 4 or 8, is {}", self.pid_size);
        }
        Ok(())
    }
}


macro_rules! read_impl {
    ($name: ident, $ty:ty, $getter: ident) => {
        pub fn $name(&mut self) -> anyhow::Result<$ty> {
            let mut buf = self.peek_remaining();
            if buf.remaining() < std::mem::size_of::<$ty>() {
                bail!("buffer underflow reading {} at offset {}", stringify!($ty), self.pos);
            }
            let result = buf.$getter();
            self.pos += std::mem::size_of::<$ty>();
            Ok(result)
        }
    }
}

/// Little-endian reader over a borrowed buffer. Every read is bounds checked and fails with an
///  error instead of panicking, since all input comes from the network.
pub struct ByteStreamIn<'a> {
    data: &'a [u8],
    pos: usize,
    pub settings: ByteStreamSettings,
}

impl<'a> ByteStreamIn<'a> {
    pub fn new(data: &'a [u8], settings: ByteStreamSettings) -> ByteStreamIn<'a> {
        ByteStreamIn { data, pos: 0, settings }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    fn peek_remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// the next `len` bytes without consuming them, `None` if there are fewer
    pub fn peek_bytes(&self, len: usize) -> Option<&'a [u8]> {
        self.peek_remaining().get(..len)
    }

    /// the raw bytes between two absolute offsets, regardless of the read position
    pub fn slice(&self, from: usize, to: usize) -> anyhow::Result<&'a [u8]> {
        if from > to || to > self.data.len() {
            bail!("invalid slice {}..{} of a buffer with length {}", from, to, self.data.len());
        }
        Ok(&self.data[from..to])
    }

    read_impl!(read_u8, u8, get_u8);
    read_impl!(read_u16_le, u16, get_u16_le);
    read_impl!(read_u32_le, u32, get_u32_le);
    read_impl!(read_u64_le, u64, get_u64_le);
    read_impl!(read_i32_le, i32, get_i32_le);

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self, len: usize) -> anyhow::Result<&'a [u8]> {
        if self.remaining() < len {
            bail!("buffer underflow reading {} bytes at offset {} ({} remaining)", len, self.pos, self.remaining());
        }
        let result = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(result)
    }

    pub fn read_remaining(&mut self) -> &'a [u8] {
        let result = self.peek_remaining();
        self.pos = self.data.len();
        result
    }

    pub fn skip(&mut self, len: usize) -> anyhow::Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    /// NEX `Buffer`: u32 length prefix
    pub fn read_buffer(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.read_u32_le()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    /// NEX `qBuffer`: u16 length prefix
    pub fn read_qbuffer(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.read_u16_le()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    /// NEX `String`: length prefix including a trailing NUL terminator
    pub fn read_string(&mut self) -> anyhow::Result<String> {
        let len = match self.settings.string_length_size {
            4 => self.read_u32_le()? as usize,
            _ => self.read_u16_le()? as usize,
        };
        let raw = self.read_bytes(len)?;
        let raw = match raw.iter().position(|&b| b == 0) {
            Some(end) => &raw[..end],
            None => raw,
        };
        Ok(String::from_utf8(raw.to_vec())?)
    }

    pub fn read_pid_raw(&mut self) -> anyhow::Result<u64> {
        match self.settings.pid_size {
            8 => self.read_u64_le(),
            _ => Ok(self.read_u32_le()? as u64),
        }
    }
}


/// Little-endian writer counterpart of [ByteStreamIn]
pub struct ByteStreamOut {
    buf: BytesMut,
    pub settings: ByteStreamSettings,
}

impl ByteStreamOut {
    pub fn new(settings: ByteStreamSettings) -> ByteStreamOut {
        ByteStreamOut {
            buf: BytesMut::new(),
            settings,
        }
    }

    pub fn with_capacity(capacity: usize, settings: ByteStreamSettings) -> ByteStreamOut {
        ByteStreamOut {
            buf: BytesMut::with_capacity(capacity),
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }
    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }
    pub fn write_u16_be(&mut self, value: u16) {
        self.buf.put_u16(value);
    }
    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }
    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }
    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }
    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn write_buffer(&mut self, data: &[u8]) {
        self.write_u32_le(data.len().prechecked_cast());
        self.write_bytes(data);
    }

    pub fn write_qbuffer(&mut self, data: &[u8]) {
        self.write_u16_le(data.len().prechecked_cast());
        self.write_bytes(data);
    }

    pub fn write_string(&mut self, value: &str) {
        let len = value.len() + 1;
        match self.settings.string_length_size {
            4 => self.write_u32_le(len.prechecked_cast()),
            _ => self.write_u16_le(len.prechecked_cast()),
        }
        self.write_bytes(value.as_bytes());
        self.write_u8(0);
    }

    pub fn write_pid_raw(&mut self, pid: u64) {
        match self.settings.pid_size {
            8 => self.write_u64_le(pid),
            _ => self.write_u32_le(pid as u32),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], false)]
    #[case::one_byte(vec![7], true)]
    fn test_read_u8_underflow(#[case] data: Vec<u8>, #[case] expected_ok: bool) {
        let mut stream = ByteStreamIn::new(&data, ByteStreamSettings::default());
        assert_eq!(stream.read_u8().is_ok(), expected_ok);
    }

    #[test]
    fn test_read_little_endian() {
        let data = vec![1, 2, 3, 4, 5, 6, 7];
        let mut stream = ByteStreamIn::new(&data, ByteStreamSettings::default());
        assert_eq!(stream.read_u16_le().unwrap(), 0x0201);
        assert_eq!(stream.read_u32_le().unwrap(), 0x06050403);
        assert_eq!(stream.remaining(), 1);
        assert!(stream.read_u16_le().is_err());
        assert_eq!(stream.position(), 6);
        assert_eq!(stream.read_remaining(), &[7]);
        assert!(!stream.has_remaining());
    }

    #[rstest]
    #[case::short_length(2, vec![4,0, b'a',b'b',b'c',0])]
    #[case::long_length(4, vec![4,0,0,0, b'a',b'b',b'c',0])]
    fn test_string(#[case] string_length_size: usize, #[case] expected: Vec<u8>) {
        let settings = ByteStreamSettings { string_length_size, ..Default::default() };

        let mut out = ByteStreamOut::new(settings);
        out.write_string("abc");
        assert_eq!(out.as_slice(), expected.as_slice());

        let mut stream = ByteStreamIn::new(&expected, settings);
        assert_eq!(stream.read_string().unwrap(), "abc");
        assert!(!stream.has_remaining());
    }

    #[rstest]
    #[case::pid4(4, vec![0x78,0x56,0x34,0x12])]
    #[case::pid8(8, vec![0x78,0x56,0x34,0x12,0,0,0,0])]
    fn test_pid(#[case] pid_size: usize, #[case] expected: Vec<u8>) {
        let settings = ByteStreamSettings { pid_size, ..Default::default() };

        let mut out = ByteStreamOut::new(settings);
        out.write_pid_raw(0x12345678);
        assert_eq!(out.as_slice(), expected.as_slice());

        let mut stream = ByteStreamIn::new(&expected, settings);
        assert_eq!(stream.read_pid_raw().unwrap(), 0x12345678);
    }

    #[test]
    fn test_buffer_length_exceeds_data() {
        let data = vec![5, 0, 0, 0, 1, 2];
        let mut stream = ByteStreamIn::new(&data, ByteStreamSettings::default());
        assert!(stream.read_buffer().is_err());
    }

    #[rstest]
    #[case::ok(ByteStreamSettings::default(), true)]
    #[case::switch(ByteStreamSettings { string_length_size: 2, pid_size: 8, use_structure_header: true }, true)]
    #[case::bad_pid(ByteStreamSettings { string_length_size: 2, pid_size: 6, use_structure_header: false }, false)]
    #[case::bad_string(ByteStreamSettings { string_length_size: 1, pid_size: 4, use_structure_header: false }, false)]
    fn test_validate(#[case] settings: ByteStreamSettings, #[case] expected_ok: bool) {
        assert_eq!(settings.validate().is_ok(), expected_ok);
    }
}
