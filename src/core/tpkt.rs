use crate::model::data::{to_vec, Message, U16};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::link::ByteChannel;
use tracing::trace;

/// TPKT version tag, fast-path PDUs are not handled
pub const TPKT_VERSION: u8 = 3;

/// version + reserved + length
pub const TPKT_HEADER_SIZE: usize = 4;

/// Default upper bound of a received frame
pub const DEFAULT_CAPACITY: usize = 16 * 1024;

/// Prefix a payload with its TPKT header
///
/// # Example
/// ```
/// use rdp::core::tpkt::frame;
/// assert_eq!(frame(&[0xaa]).unwrap(), [3, 0, 0, 5, 0xaa]);
/// ```
pub fn frame(payload: &[u8]) -> RdpResult<Vec<u8>> {
    let length = payload.len() + TPKT_HEADER_SIZE;
    if length > u16::MAX as usize {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "TPKT: payload too large for a single frame",
        )));
    }
    let mut result = to_vec(&trame![TPKT_VERSION, 0_u8, U16::BE(length as u16)])?;
    result.extend_from_slice(payload);
    Ok(result)
}

/// Check a received TPKT header
/// and return the size of the payload which follows
pub fn payload_size(header: &[u8], capacity: usize) -> RdpResult<usize> {
    if header.len() < TPKT_HEADER_SIZE {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "TPKT: truncated header",
        )));
    }
    if header[0] != TPKT_VERSION {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidVersion,
            &format!("TPKT: unsupported version {}", header[0]),
        )));
    }
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    if length < TPKT_HEADER_SIZE || length > capacity {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            &format!("TPKT: invalid frame length {}", length),
        )));
    }
    Ok(length - TPKT_HEADER_SIZE)
}

/// TPKT layer client
/// Reads and writes length prefixed frames on a byte channel
pub struct Client<C> {
    transport: C,
    capacity: usize,
}

impl<C: ByteChannel> Client<C> {
    /// Wrap a byte channel with the default frame capacity
    pub fn new(transport: C) -> Self {
        Self::with_capacity(transport, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(transport: C, capacity: usize) -> Self {
        Client {
            transport,
            capacity,
        }
    }

    /// Send a message in a single frame
    pub fn write(&mut self, message: &dyn Message) -> RdpResult<()> {
        let payload = to_vec(message)?;
        if payload.len() + TPKT_HEADER_SIZE > self.capacity {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "TPKT: frame exceeds capacity",
            )));
        }
        trace!(size = payload.len(), "TPKT send");
        self.transport.send(&frame(&payload)?)
    }

    /// Read the header then exactly the announced payload
    pub fn read(&mut self) -> RdpResult<Vec<u8>> {
        let header = self.transport.recv_exact(TPKT_HEADER_SIZE)?;
        let size = payload_size(&header, self.capacity)?;
        trace!(size, "TPKT receive");
        self.transport.recv_exact(size)
    }

    /// Upgrade the underlying channel to TLS
    pub fn start_tls(self, check_certificate: bool) -> RdpResult<Self> {
        Ok(Client {
            transport: self.transport.start_tls(check_certificate)?,
            capacity: self.capacity,
        })
    }

    pub fn disconnect(&mut self) -> RdpResult<()> {
        self.transport.disconnect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::link::{Link, ScriptedStream, Stream};

    #[test]
    fn test_write_frame() {
        let (stream, output) = ScriptedStream::new(vec![]);
        let mut client = Client::new(Link::new(Stream::Raw(stream)));
        client.write(&trame![0x02_u8, 0xf0_u8, 0x80_u8]).unwrap();
        assert_eq!(*output.borrow(), [3, 0, 0, 7, 0x02, 0xf0, 0x80]);
    }

    #[test]
    fn test_read_frame() {
        let (stream, _) = ScriptedStream::new(vec![3, 0, 0, 6, 0xaa, 0xbb, 0xcc]);
        let mut client = Client::new(Link::new(Stream::Raw(stream)));
        assert_eq!(client.read().unwrap(), [0xaa, 0xbb]);
    }

    #[test]
    fn test_read_invalid_version() {
        let (stream, _) = ScriptedStream::new(vec![0x30, 0, 0, 6, 0xaa, 0xbb]);
        let mut client = Client::new(Link::new(Stream::Raw(stream)));
        assert_eq!(
            client.read().unwrap_err().kind(),
            Some(RdpErrorKind::InvalidVersion)
        );
    }

    #[test]
    fn test_read_exceeds_capacity() {
        let (stream, _) = ScriptedStream::new(vec![3, 0, 0x01, 0x00]);
        let mut client = Client::with_capacity(Link::new(Stream::Raw(stream)), 128);
        assert_eq!(
            client.read().unwrap_err().kind(),
            Some(RdpErrorKind::InvalidSize)
        );
    }

    #[test]
    fn test_read_length_below_header() {
        assert_eq!(
            payload_size(&[3, 0, 0, 2], DEFAULT_CAPACITY)
                .unwrap_err()
                .kind(),
            Some(RdpErrorKind::InvalidSize)
        );
    }
}
