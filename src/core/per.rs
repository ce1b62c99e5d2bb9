use crate::model::data::{Trame, U16};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

/// PER encoding of a length
///
/// # Example
/// ```
/// use rdp::core::per::write_length;
/// use rdp::model::data::to_vec;
/// assert_eq!(to_vec(&write_length(0x12)).unwrap(), [0x12]);
/// assert_eq!(to_vec(&write_length(0x123)).unwrap(), [0x81, 0x23]);
/// ```
pub fn write_length(length: u16) -> Trame {
    if length > 0x7f {
        trame![U16::BE(length | 0x8000)]
    } else {
        trame![length as u8]
    }
}

/// Read a PER length
///
/// # Example
/// ```
/// use rdp::core::per::read_length;
/// use std::io::Cursor;
/// assert_eq!(read_length(&mut Cursor::new(vec![0x81, 0x23])).unwrap(), 0x123);
/// ```
pub fn read_length(s: &mut dyn Read) -> RdpResult<u16> {
    let byte = s.read_u8()?;
    if byte & 0x80 != 0 {
        Ok(((byte as u16 & 0x7f) << 8) | s.read_u8()? as u16)
    } else {
        Ok(byte as u16)
    }
}

/// Read a PER length and check it against the bytes left
pub fn read_bounded_length(s: &mut dyn Read, remaining: usize) -> RdpResult<usize> {
    let length = read_length(s)? as usize;
    if length > remaining {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            &format!("PER: length {} exceeds {} remaining bytes", length, remaining),
        )));
    }
    Ok(length)
}

/// 16 bits integer encoded relative to a lower bound
///
/// # Example
/// ```
/// use rdp::core::per::write_integer_16;
/// use rdp::model::data::to_vec;
/// assert_eq!(to_vec(&write_integer_16(1007, 1001).unwrap()).unwrap(), [0, 6]);
/// ```
pub fn write_integer_16(value: u16, minimum: u16) -> RdpResult<U16> {
    match value.checked_sub(minimum) {
        Some(v) => Ok(U16::BE(v)),
        None => Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "PER: integer below its lower bound",
        ))),
    }
}

/// Read a 16 bits integer encoded relative to a lower bound
pub fn read_integer_16(s: &mut dyn Read, minimum: u16) -> RdpResult<u16> {
    s.read_u16::<BigEndian>()?
        .checked_add(minimum)
        .ok_or_else(|| {
            Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                "PER: integer overflow",
            ))
        })
}

/// Read an enumerated value and check its bound
pub fn read_enumerates(s: &mut dyn Read) -> RdpResult<u8> {
    Ok(s.read_u8()?)
}

/// PER unconstrained integer, used by erect domain request
pub fn write_integer(value: u32) -> Trame {
    if value <= 0xff {
        trame![write_length(1), value as u8]
    } else if value <= 0xffff {
        trame![write_length(2), U16::BE(value as u16)]
    } else {
        trame![write_length(4), crate::model::data::U32::BE(value)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::data::to_vec;
    use std::io::Cursor;

    #[test]
    fn test_length_boundaries() {
        assert_eq!(to_vec(&write_length(0x7f)).unwrap(), [0x7f]);
        assert_eq!(to_vec(&write_length(0x80)).unwrap(), [0x80, 0x80]);
        assert_eq!(read_length(&mut Cursor::new(vec![0x80, 0x80])).unwrap(), 0x80);
    }

    #[test]
    fn test_bounded_length() {
        assert_eq!(
            read_bounded_length(&mut Cursor::new(vec![0x05]), 4)
                .unwrap_err()
                .kind(),
            Some(RdpErrorKind::InvalidSize)
        );
    }

    #[test]
    fn test_integer_16_lower_bound() {
        assert!(write_integer_16(1000, 1001).is_err());
        assert_eq!(
            read_integer_16(&mut Cursor::new(vec![0, 6]), 1001).unwrap(),
            1007
        );
    }

    #[test]
    fn test_write_integer() {
        assert_eq!(to_vec(&write_integer(1)).unwrap(), [1, 1]);
        assert_eq!(to_vec(&write_integer(0x1234)).unwrap(), [2, 0x12, 0x34]);
    }
}
