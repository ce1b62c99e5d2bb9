use byteorder::{LittleEndian, WriteBytesExt};

/// Encode a string as UTF-16 little endian bytes,
/// the format used for names and credentials on the wire
pub trait Unicode {
    fn to_unicode(&self) -> Vec<u8>;
}

impl Unicode for str {
    /// # Example
    /// ```
    /// use rdp::model::unicode::Unicode;
    /// assert_eq!("AB".to_unicode(), [0x41, 0, 0x42, 0]);
    /// ```
    fn to_unicode(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len() * 2);
        for c in self.encode_utf16() {
            // writing into a vector never fails
            let _ = result.write_u16::<LittleEndian>(c);
        }
        result
    }
}

/// Write `value` as UTF-16 into a zero padded buffer of `size` bytes.
/// The last code unit is always left null.
pub fn to_fixed_unicode(value: &str, size: usize) -> Vec<u8> {
    let mut result = value.to_unicode();
    result.truncate(size.saturating_sub(2) & !1);
    result.resize(size, 0);
    result
}

/// Decode a null terminated (or padded) UTF-16 little endian buffer
pub fn from_unicode(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|c| *c != 0)
        .collect();
    String::from_utf16_lossy(&units)
}
