use crate::core::tpkt;
use crate::model::data::{to_vec, Component, Message, U16, U32};
use crate::model::error::{Error, ProtocolNegFailureCode, RdpError, RdpErrorKind, RdpResult};
use crate::model::link::ByteChannel;
use num_enum::TryFromPrimitive;
use std::convert::TryFrom;
use tracing::{debug, info, trace, warn};

/// TPDU type code, stored in the high nibble of the second header byte
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum TpduCode {
    ConnectionRequest = 0xE0,
    ConnectionConfirm = 0xD0,
    DisconnectRequest = 0x80,
    Data = 0xF0,
    Error = 0x70,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum NegotiationType {
    /// Negotiation request
    /// Send from client to server
    TypeRDPNegReq = 0x01,
    /// Negotiation Response
    /// Send from Server to client
    TypeRDPNegRsp = 0x02,
    /// Negotiation failure
    /// Send when security level are not expected
    /// Server ask for NLA and client doesn't support it
    TypeRDPNegFailure = 0x03,
}

/// Security protocols offered in the negotiation request
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum Protocols {
    /// Standard RDP security layer
    ProtocolRDP = 0x00,
    /// TLS only
    ProtocolSSL = 0x01,
    /// CredSSP over TLS
    ProtocolHybrid = 0x02,
}

/// Size of the negotiation block
pub const NEGOTIATION_SIZE: u8 = 8;

/// Error TPDU parameter code: invalid TPDU
const INVALID_TPDU_PARAMETER: u8 = 0xC1;

/// End of transmission flag of a data TPDU
const EOT: u8 = 0x80;

/// Optional negotiation block of CR and CC TPDUs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    Request { flags: u8, protocols: u32 },
    Response { flags: u8, protocol: u32 },
    Failure { flags: u8, code: ProtocolNegFailureCode },
}

impl Negotiation {
    fn component(&self) -> Component {
        let (kind, flags, value) = match self {
            Negotiation::Request { flags, protocols } => {
                (NegotiationType::TypeRDPNegReq, *flags, *protocols)
            }
            Negotiation::Response { flags, protocol } => {
                (NegotiationType::TypeRDPNegRsp, *flags, *protocol)
            }
            Negotiation::Failure { flags, code } => {
                (NegotiationType::TypeRDPNegFailure, *flags, code.code())
            }
        };
        component![
            "type" => kind as u8,
            "flag" => flags,
            "length" => U16::LE(NEGOTIATION_SIZE as u16),
            "result" => U32::LE(value)
        ]
    }

    fn from_bytes(data: &[u8]) -> RdpResult<Self> {
        if data.len() != NEGOTIATION_SIZE as usize {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "X224: invalid negotiation block size",
            )));
        }
        let flags = data[1];
        let value = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let kind = NegotiationType::try_from(data[0]).map_err(|_| {
            Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidData,
                &format!("X224: unknown negotiation type {}", data[0]),
            ))
        })?;
        Ok(match kind {
            NegotiationType::TypeRDPNegReq => Negotiation::Request {
                flags,
                protocols: value,
            },
            NegotiationType::TypeRDPNegRsp => Negotiation::Response {
                flags,
                protocol: value,
            },
            NegotiationType::TypeRDPNegFailure => Negotiation::Failure {
                flags,
                code: ProtocolNegFailureCode::from_code(value),
            },
        })
    }
}

/// One X224 TPDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X224Pdu {
    /// `cookie` holds the routing token line without its CR LF
    ConnectionRequest {
        cookie: Option<String>,
        negotiation: Option<Negotiation>,
    },
    ConnectionConfirm {
        negotiation: Option<Negotiation>,
    },
    Data {
        eot: bool,
        payload: Vec<u8>,
    },
    DisconnectRequest {
        reason: u8,
    },
    Error {
        cause: u8,
    },
}

impl X224Pdu {
    pub fn code(&self) -> TpduCode {
        match self {
            X224Pdu::ConnectionRequest { .. } => TpduCode::ConnectionRequest,
            X224Pdu::ConnectionConfirm { .. } => TpduCode::ConnectionConfirm,
            X224Pdu::Data { .. } => TpduCode::Data,
            X224Pdu::DisconnectRequest { .. } => TpduCode::DisconnectRequest,
            X224Pdu::Error { .. } => TpduCode::Error,
        }
    }

    /// Encode the TPDU, length indicator included
    ///
    /// # Example
    /// ```
    /// use rdp::core::x224::X224Pdu;
    /// let pdu = X224Pdu::Data { eot: true, payload: vec![0xaa] };
    /// assert_eq!(pdu.to_bytes().unwrap(), [2, 0xf0, 0x80, 0xaa]);
    /// ```
    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let message: Box<dyn Message> = match self {
            X224Pdu::ConnectionRequest {
                cookie,
                negotiation,
            } => {
                let cookie = cookie
                    .as_ref()
                    .map(|c| format!("{}\r\n", c).into_bytes())
                    .unwrap_or_default();
                let negotiation = negotiation
                    .as_ref()
                    .map(Negotiation::component)
                    .unwrap_or_default();
                let length = 6 + cookie.len() as u64 + negotiation.length();
                if length > u8::MAX as u64 {
                    return Err(Error::RdpError(RdpError::new(
                        RdpErrorKind::InvalidSize,
                        "X224: connection request header too long",
                    )));
                }
                Box::new(component![
                    "len" => length as u8,
                    "code" => TpduCode::ConnectionRequest as u8,
                    "padding" => trame![U16::LE(0), U16::LE(0), 0_u8],
                    "cookie" => cookie,
                    "negotiation" => negotiation
                ])
            }
            X224Pdu::ConnectionConfirm { negotiation } => {
                let negotiation = negotiation
                    .as_ref()
                    .map(Negotiation::component)
                    .unwrap_or_default();
                Box::new(component![
                    "len" => (6 + negotiation.length()) as u8,
                    "code" => TpduCode::ConnectionConfirm as u8,
                    "padding" => trame![U16::LE(0), U16::LE(0), 0_u8],
                    "negotiation" => negotiation
                ])
            }
            X224Pdu::Data { eot, payload } => Box::new(component![
                "header" => trame![2_u8, TpduCode::Data as u8, if *eot { EOT } else { 0 }],
                "payload" => payload.clone()
            ]),
            X224Pdu::DisconnectRequest { reason } => Box::new(trame![
                6_u8,
                TpduCode::DisconnectRequest as u8,
                U16::LE(0),
                U16::LE(0),
                *reason
            ]),
            X224Pdu::Error { cause } => Box::new(trame![
                6_u8,
                TpduCode::Error as u8,
                U16::LE(0),
                *cause,
                INVALID_TPDU_PARAMETER,
                0_u8
            ]),
        };
        to_vec(message.as_ref())
    }

    /// Decode one TPDU, the buffer being the whole TPKT payload
    pub fn from_bytes(data: &[u8]) -> RdpResult<Self> {
        if data.len() < 2 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                "X224: truncated TPDU header",
            )));
        }
        let li = data[0] as usize;
        if li < 1 || li > data.len() - 1 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidSize,
                &format!("X224: length indicator {} exceeds buffer", li),
            )));
        }
        let code = TpduCode::try_from(data[1] & 0xF0).map_err(|_| {
            Error::RdpError(RdpError::new(
                RdpErrorKind::UnknownPdu,
                &format!("X224: unknown TPDU code {:#x}", data[1]),
            ))
        })?;
        // bytes covered by the length indicator, code included
        let header = &data[1..=li];

        match code {
            TpduCode::Data => {
                if li < 2 {
                    return Err(Error::RdpError(RdpError::new(
                        RdpErrorKind::InvalidSize,
                        "X224: data header too short",
                    )));
                }
                Ok(X224Pdu::Data {
                    eot: header[1] & EOT != 0,
                    payload: data[li + 1..].to_vec(),
                })
            }
            TpduCode::DisconnectRequest => {
                check_fixed(li, 6)?;
                Ok(X224Pdu::DisconnectRequest { reason: header[5] })
            }
            TpduCode::Error => {
                check_fixed(li, 4)?;
                Ok(X224Pdu::Error { cause: header[3] })
            }
            TpduCode::ConnectionConfirm => {
                check_fixed(li, 6)?;
                let negotiation = if li == 6 + NEGOTIATION_SIZE as usize {
                    Some(Negotiation::from_bytes(&header[6..])?)
                } else {
                    None
                };
                Ok(X224Pdu::ConnectionConfirm { negotiation })
            }
            TpduCode::ConnectionRequest => {
                check_fixed(li, 6)?;
                let mut variable = &header[6..];
                let mut cookie = None;
                if let Some(end) = variable.windows(2).position(|w| w == b"\r\n") {
                    cookie = Some(String::from_utf8_lossy(&variable[..end]).into_owned());
                    variable = &variable[end + 2..];
                }
                let negotiation = match variable.len() {
                    0 => None,
                    n if n == NEGOTIATION_SIZE as usize => {
                        Some(Negotiation::from_bytes(variable)?)
                    }
                    n => {
                        warn!(size = n, "X224: ignoring unexpected connection request trailer");
                        None
                    }
                };
                Ok(X224Pdu::ConnectionRequest {
                    cookie,
                    negotiation,
                })
            }
        }
    }
}

fn check_fixed(li: usize, minimum: usize) -> RdpResult<()> {
    if li < minimum {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidSize,
            "X224: TPDU header too short",
        )));
    }
    Ok(())
}

/// X224 client, owns the TPKT layer
pub struct Client<C> {
    transport: tpkt::Client<C>,
    selected_protocol: Protocols,
}

impl<C: ByteChannel> Client<C> {
    /// Send a connection request and wait for the confirm.
    ///
    /// When the server selects TLS the transport is upgraded
    /// before returning.
    pub fn connect(
        mut transport: tpkt::Client<C>,
        cookie: Option<String>,
        protocols: u32,
        check_certificate: bool,
    ) -> RdpResult<Client<C>> {
        let selected = match Self::negotiate(&mut transport, cookie, protocols) {
            Ok(selected) => selected,
            Err(e) => {
                if let Err(close) = transport.disconnect() {
                    debug!("X224: transport close failed: {}", close);
                }
                return Err(e);
            }
        };

        let transport = match selected {
            Protocols::ProtocolSSL => transport.start_tls(check_certificate)?,
            _ => transport,
        };

        Ok(Client {
            transport,
            selected_protocol: selected,
        })
    }

    fn negotiate(
        transport: &mut tpkt::Client<C>,
        cookie: Option<String>,
        protocols: u32,
    ) -> RdpResult<Protocols> {
        let request = X224Pdu::ConnectionRequest {
            cookie,
            negotiation: Some(Negotiation::Request {
                flags: 0,
                protocols,
            }),
        };
        transport.write(&request.to_bytes()?)?;

        let negotiation = match X224Pdu::from_bytes(&transport.read()?)? {
            X224Pdu::ConnectionConfirm { negotiation } => negotiation,
            X224Pdu::DisconnectRequest { reason } => {
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::Disconnect,
                    &format!("X224: connection refused, reason {}", reason),
                )))
            }
            other => {
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidRespond,
                    &format!("X224: expected connection confirm, got {:?}", other.code()),
                )))
            }
        };

        let selected = match negotiation {
            // legacy servers answer without negotiation block
            None => Protocols::ProtocolRDP,
            Some(Negotiation::Response { protocol, .. }) => Protocols::try_from(protocol)
                .map_err(|_| {
                    Error::RdpError(RdpError::new(
                        RdpErrorKind::InvalidProtocol,
                        &format!("X224: unknown selected protocol {}", protocol),
                    ))
                })?,
            Some(Negotiation::Failure { code, .. }) => {
                return Err(Error::NegotiationFailure(code));
            }
            Some(Negotiation::Request { .. }) => {
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidRespond,
                    "X224: server sent a negotiation request",
                )))
            }
        };

        if selected == Protocols::ProtocolHybrid {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidProtocol,
                "X224: CredSSP is not supported",
            )));
        }
        if selected as u32 & protocols != selected as u32 {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidProtocol,
                "X224: server selected a protocol that was not offered",
            )));
        }
        info!(protocol = ?selected, "X224: connection confirmed");
        Ok(selected)
    }

    /// Send a payload inside a data TPDU
    pub fn write(&mut self, message: &dyn Message) -> RdpResult<()> {
        let pdu = X224Pdu::Data {
            eot: true,
            payload: to_vec(message)?,
        };
        self.transport.write(&pdu.to_bytes()?)
    }

    /// Read the payload of the next data TPDU
    pub fn read(&mut self) -> RdpResult<Vec<u8>> {
        match X224Pdu::from_bytes(&self.transport.read()?)? {
            X224Pdu::Data { payload, .. } => Ok(payload),
            X224Pdu::DisconnectRequest { reason } => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::Disconnect,
                &format!("X224: disconnect request, reason {}", reason),
            ))),
            X224Pdu::Error { cause } => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidRespond,
                &format!("X224: error TPDU, cause {}", cause),
            ))),
            other => Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidAutomata,
                &format!("X224: unexpected {:?} on established connection", other.code()),
            ))),
        }
    }

    /// Best effort disconnect request then transport shutdown
    pub fn disconnect(&mut self) -> RdpResult<()> {
        trace!("X224: send disconnect request");
        let sent = X224Pdu::DisconnectRequest { reason: 0 }
            .to_bytes()
            .and_then(|pdu| self.transport.write(&pdu));
        let closed = self.transport.disconnect();
        sent.and(closed)
    }

    pub fn get_selected_protocols(&self) -> Protocols {
        self.selected_protocol
    }
}
