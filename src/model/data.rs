use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use indexmap::IndexMap;
use std::io::{Cursor, Write};

/// All is a message
///
/// Outgoing PDUs are built as a tree of messages then serialized,
/// incoming ones are decoded field by field from a cursor.
pub trait Message: Send {
    /// Write node to the Stream
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()>;

    /// Length in bytes of current element
    fn length(&self) -> u64;
}

impl Message for u8 {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        Ok(writer.write_u8(*self)?)
    }

    fn length(&self) -> u64 {
        1
    }
}

/// Trame is just a list of boxed Message
/// # Example
///
/// ```
/// # #[macro_use]
/// # extern crate rdp;
/// # use rdp::model::data::{Message, Trame, U32};
/// # fn main() {
///     let t = trame! [0_u8, U32::BE(4)];
///     assert_eq!(t.length(), 5);
/// # }
/// ```
pub type Trame = Vec<Box<dyn Message>>;

/// Macro to easily init a new Trame of message
#[macro_export]
macro_rules! trame {
    () => { $crate::model::data::Trame::new() };
    ($( $val: expr ),*) => {{
        let mut vec = $crate::model::data::Trame::new();
        $( vec.push(Box::new($val)); )*
        vec
    }}
}

impl Message for Trame {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        for v in self {
            v.write(writer)?;
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.iter().map(|v| v.length()).sum()
    }
}

/// A component is key value ordered, fields are written in insertion order
pub type Component = IndexMap<String, Box<dyn Message>>;

#[macro_export]
macro_rules! component {
    ($( $key: expr => $val: expr ),*) => {{
        #[allow(unused_mut)]
        let mut map = $crate::model::data::Component::new();
        $( map.insert($key.to_string(), Box::new($val)) ; )*
        map
    }}
}

impl Message for Component {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        for value in self.values() {
            value.write(writer)?;
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.values().map(|value| value.length()).sum()
    }
}

/// Integer with an explicit byte order
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Value<Type> {
    /// Big Endian
    BE(Type),
    /// Little Endian
    LE(Type),
}

/// Unsigned 16 bits message
pub type U16 = Value<u16>;

impl Message for U16 {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        match self {
            U16::BE(value) => Ok(writer.write_u16::<BigEndian>(*value)?),
            U16::LE(value) => Ok(writer.write_u16::<LittleEndian>(*value)?),
        }
    }

    fn length(&self) -> u64 {
        2
    }
}

/// Unsigned 32 bits message
pub type U32 = Value<u32>;

impl Message for U32 {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        match self {
            U32::BE(value) => Ok(writer.write_u32::<BigEndian>(*value)?),
            U32::LE(value) => Ok(writer.write_u32::<LittleEndian>(*value)?),
        }
    }

    fn length(&self) -> u64 {
        4
    }
}

impl Message for Vec<u8> {
    fn write(&self, writer: &mut dyn Write) -> RdpResult<()> {
        writer.write_all(self)?;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.len() as u64
    }
}

/// Serialize a message into a new buffer
///
/// # Example
/// ```
/// # #[macro_use]
/// # extern crate rdp;
/// # use rdp::model::data::{to_vec, U16};
/// # fn main() {
/// assert_eq!(to_vec(&trame![1_u8, U16::BE(2)]).unwrap(), [1, 0, 2]);
/// # }
/// ```
pub fn to_vec(message: &dyn Message) -> RdpResult<Vec<u8>> {
    let mut buffer = Vec::with_capacity(message.length() as usize);
    message.write(&mut buffer)?;
    Ok(buffer)
}

/// Bytes left after the cursor position
pub fn remaining(stream: &Cursor<&[u8]>) -> usize {
    (stream.get_ref().len() as u64).saturating_sub(stream.position()) as usize
}

/// Borrow the next `size` bytes of a cursor, failing instead of overrunning
///
/// # Example
/// ```
/// use rdp::model::data::read_slice;
/// use std::io::Cursor;
/// let data = [1_u8, 2, 3];
/// let mut stream = Cursor::new(&data[..]);
/// assert_eq!(read_slice(&mut stream, 2).unwrap(), [1, 2]);
/// assert!(read_slice(&mut stream, 2).is_err());
/// ```
pub fn read_slice<'a>(stream: &mut Cursor<&'a [u8]>, size: usize) -> RdpResult<&'a [u8]> {
    if remaining(stream) < size {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            &format!("need {} bytes, {} left", size, remaining(stream)),
        )));
    }
    let start = stream.position() as usize;
    let data: &'a [u8] = *stream.get_ref();
    stream.set_position((start + size) as u64);
    Ok(&data[start..start + size])
}
