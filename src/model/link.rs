use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use std::convert::TryFrom;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

use rustls::{
    client::{NoClientSessionStorage, ServerCertVerified, ServerCertVerifier},
    Certificate, ClientConfig, ClientConnection, Error as RustlsError, RootCertStore, ServerName,
    StreamOwned,
};

/// Blocking byte transport used by the framing layer
///
/// `recv_exact` either returns exactly the requested
/// number of bytes or fails, partial reads are never surfaced.
pub trait ByteChannel {
    /// Send the whole buffer
    fn send(&mut self, data: &[u8]) -> RdpResult<()>;

    /// Block until exactly `size` bytes are available
    fn recv_exact(&mut self, size: usize) -> RdpResult<Vec<u8>>;

    /// Close the channel, any further call fails
    fn disconnect(&mut self) -> RdpResult<()>;

    /// Switch the channel to TLS
    fn start_tls(self, _check_certificate: bool) -> RdpResult<Self>
    where
        Self: Sized,
    {
        Err(Error::RdpError(RdpError::new(
            RdpErrorKind::NotImplemented,
            "this channel can not be upgraded to TLS",
        )))
    }
}

/// Marks all server certificates as valid
/// so it can be used to turn off the server certificate
/// validation on the client-side.
struct DummyTlsVerifier;

impl ServerCertVerifier for DummyTlsVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

/// This a wrapper to work equals
/// for a stream and a TLS stream
pub enum Stream<S: Read + Write> {
    /// Raw stream that implement Read + Write
    Raw(S),
    /// TLS Stream
    Ssl(Box<StreamOwned<ClientConnection, S>>),
}

impl<S: Read + Write> Stream<S> {
    /// Read exactly the number of bytes present in buffer
    ///
    /// # Example
    /// ```
    /// use rdp::model::link::Stream;
    /// use std::io::Cursor;
    /// let mut s = Stream::Raw(Cursor::new(vec![1, 2, 3]));
    /// let mut result = [0, 0];
    /// s.read_exact(&mut result).unwrap();
    /// assert_eq!(result, [1, 2])
    /// ```
    pub fn read_exact(&mut self, buf: &mut [u8]) -> RdpResult<()> {
        match self {
            Stream::Raw(e) => e.read_exact(buf)?,
            Stream::Ssl(e) => e.read_exact(buf)?,
        };
        Ok(())
    }

    /// Write all buffer to the stream
    pub fn write_all(&mut self, buffer: &[u8]) -> RdpResult<()> {
        match self {
            Stream::Raw(e) => {
                e.write_all(buffer)?;
                e.flush()?
            }
            Stream::Ssl(e) => {
                e.write_all(buffer)?;
                e.flush()?
            }
        };
        Ok(())
    }

    /// Shutdown the stream
    /// Only sends something when stream is a SSL stream
    pub fn shutdown(&mut self) -> RdpResult<()> {
        if let Stream::Ssl(stream) = self {
            stream.conn.send_close_notify();
            stream.flush()?;
        }
        Ok(())
    }
}

/// Link layer is a wrapper around TCP or SSL stream
/// It can switch from TCP to SSL
pub struct Link<S: Read + Write> {
    stream: Stream<S>,
    connected: bool,
}

impl<S: Read + Write> Link<S> {
    /// Create a new link layer from a Stream
    ///
    /// # Example
    /// ```no_run
    /// use rdp::model::link::{Link, Stream};
    /// use std::io::Cursor;
    /// use std::net::{TcpStream, SocketAddr};
    /// let link = Link::new(Stream::Raw(Cursor::new(vec![])));
    /// let addr = "127.0.0.1:3389".parse::<SocketAddr>().unwrap();
    /// let link_tcp = Link::new(Stream::Raw(TcpStream::connect(&addr).unwrap()));
    /// ```
    pub fn new(stream: Stream<S>) -> Self {
        Link {
            stream,
            connected: true,
        }
    }

    /// Start a ssl connection from a raw stream
    ///
    /// # Example
    /// ```no_run
    /// use rdp::model::link::{Link, Stream};
    /// use std::net::{TcpStream, SocketAddr};
    /// let addr = "127.0.0.1:3389".parse::<SocketAddr>().unwrap();
    /// let link_tcp = Link::new(Stream::Raw(TcpStream::connect(&addr).unwrap()));
    /// let link_ssl = link_tcp.start_ssl(false).unwrap();
    /// ```
    pub fn start_ssl(self, check_certificate: bool) -> RdpResult<Link<S>> {
        let root_store = RootCertStore::empty();
        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if !check_certificate {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(DummyTlsVerifier {}));
        }

        // SNI is never sent but rustls still wants a valid DNS name
        config.enable_sni = false;
        let server_name = ServerName::try_from("servername").map_err(|_| {
            Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                "invalid TLS server name",
            ))
        })?;
        config.session_storage = Arc::new(NoClientSessionStorage {});

        let conn = ClientConnection::new(Arc::new(config), server_name)?;

        match self.stream {
            Stream::Raw(stream) => {
                debug!("link upgraded to TLS");
                Ok(Link::new(Stream::Ssl(Box::new(StreamOwned::new(
                    conn, stream,
                )))))
            }
            Stream::Ssl(_) => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::NotImplemented,
                "start_ssl on ssl stream is forbidden",
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn check_connected(&self) -> RdpResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::RdpError(RdpError::new(
                RdpErrorKind::Disconnect,
                "link is disconnected",
            )))
        }
    }
}

impl<S: Read + Write> ByteChannel for Link<S> {
    fn send(&mut self, data: &[u8]) -> RdpResult<()> {
        self.check_connected()?;
        self.stream.write_all(data)
    }

    fn recv_exact(&mut self, size: usize) -> RdpResult<Vec<u8>> {
        self.check_connected()?;
        let mut buffer = vec![0; size];
        self.stream.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn disconnect(&mut self) -> RdpResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.stream.shutdown()
    }

    fn start_tls(self, check_certificate: bool) -> RdpResult<Self> {
        self.check_connected()?;
        self.start_ssl(check_certificate)
    }
}

#[cfg(test)]
pub use self::scripted::ScriptedStream;

#[cfg(test)]
mod scripted {
    use std::cell::RefCell;
    use std::io::{Cursor, Read, Result, Write};
    use std::rc::Rc;

    /// In memory peer: replays canned bytes
    /// and records everything written to it
    pub struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        output: Rc<RefCell<Vec<u8>>>,
    }

    impl ScriptedStream {
        pub fn new(input: Vec<u8>) -> (Self, Rc<RefCell<Vec<u8>>>) {
            let output = Rc::new(RefCell::new(Vec::new()));
            (
                ScriptedStream {
                    input: Cursor::new(input),
                    output: Rc::clone(&output),
                },
                output,
            )
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            self.output.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
