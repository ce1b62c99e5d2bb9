use crate::core::gcc;
use crate::core::per;
use crate::core::x224;
use crate::model::data::{read_slice, remaining, to_vec, Message, U16};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::link::ByteChannel;
use byteorder::{BigEndian, ReadBytesExt};
use indexmap::IndexMap;
use num_enum::TryFromPrimitive;
use std::convert::TryFrom;
use std::io::Cursor;
use tracing::{debug, info, trace, warn};
use yasna::{ASN1Result, BERReader, DERWriter, Tag, TagClass};

/// Broadcast channel every user joins
pub const GLOBAL_CHANNEL_ID: u16 = gcc::GLOBAL_CHANNEL_ID;
pub const GLOBAL_CHANNEL_NAME: &str = "global";
/// User ids are encoded relative to this base,
/// the user channel is the decoded id
pub const MCS_USERCHANNEL_BASE: u16 = 1001;
pub const USER_CHANNEL_NAME: &str = "user";

const CONNECT_INITIAL: Tag = Tag {
    tag_class: TagClass::Application,
    tag_number: 101,
};
const CONNECT_RESPONSE: Tag = Tag {
    tag_class: TagClass::Application,
    tag_number: 102,
};

/// Segmentation begin and end, high priority
const SEND_DATA_FLAGS: u8 = 0x70;

/// rn-provider-initiated
const DISCONNECT_REASON_PROVIDER: u8 = 3;

/// Domain PDU opcodes, stored in the six high bits of the first byte
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum DomainMcsPdu {
    ErectDomainRequest = 1,
    DisconnectProviderUltimatum = 8,
    AttachUserRequest = 10,
    AttachUserConfirm = 11,
    ChannelJoinRequest = 14,
    ChannelJoinConfirm = 15,
    SendDataRequest = 25,
    SendDataIndication = 26,
}

/// Connect response and confirm result codes
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum McsResult {
    RtSuccessful = 0,
    RtDomainMerging = 1,
    RtDomainNotHierarchical = 2,
    RtNoSuchChannel = 3,
    RtNoSuchDomain = 4,
    RtNoSuchUser = 5,
    RtNotAdmitted = 6,
    RtOtherUserId = 7,
    RtParametersUnacceptable = 8,
    RtTokenNotAvailable = 9,
    RtTokenNotPossessed = 10,
    RtTooManyChannels = 11,
    RtTooManyTokens = 12,
    RtTooManyUsers = 13,
    RtUnspecifiedFailure = 14,
    RtUserRejected = 15,
}

fn check_result(result: u8, step: &str) -> RdpResult<()> {
    if result == McsResult::RtSuccessful as u8 {
        return Ok(());
    }
    let reason = McsResult::try_from(result)
        .map(|r| format!("{:?}", r))
        .unwrap_or_else(|_| format!("unknown result {}", result));
    Err(Error::RdpError(RdpError::new(
        RdpErrorKind::RejectedByServer,
        &format!("MCS: {} refused: {}", step, reason),
    )))
}

/// T.125 domain parameters
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DomainParameters {
    pub max_channel_ids: u32,
    pub max_user_ids: u32,
    pub max_token_ids: u32,
    pub num_priorities: u32,
    pub min_throughput: u32,
    pub max_height: u32,
    pub max_mcs_pdu_size: u32,
    pub protocol_version: u32,
}

impl DomainParameters {
    #[allow(clippy::too_many_arguments)]
    const fn new(
        max_channel_ids: u32,
        max_user_ids: u32,
        max_token_ids: u32,
        num_priorities: u32,
        min_throughput: u32,
        max_height: u32,
        max_mcs_pdu_size: u32,
        protocol_version: u32,
    ) -> Self {
        DomainParameters {
            max_channel_ids,
            max_user_ids,
            max_token_ids,
            num_priorities,
            min_throughput,
            max_height,
            max_mcs_pdu_size,
            protocol_version,
        }
    }

    pub const fn target() -> Self {
        Self::new(34, 2, 0, 1, 0, 1, 0xffff, 2)
    }

    pub const fn minimum() -> Self {
        Self::new(1, 1, 1, 1, 0, 1, 0x420, 2)
    }

    pub const fn maximum() -> Self {
        Self::new(0xffff, 0xfc17, 0xffff, 1, 0, 1, 0xffff, 2)
    }

    /// Parameters a server settles on
    pub const fn negotiated() -> Self {
        Self::new(22, 3, 0, 1, 0, 1, 0xfff8, 2)
    }

    fn write(&self, writer: DERWriter) {
        writer.write_sequence(|writer| {
            writer.next().write_u32(self.max_channel_ids);
            writer.next().write_u32(self.max_user_ids);
            writer.next().write_u32(self.max_token_ids);
            writer.next().write_u32(self.num_priorities);
            writer.next().write_u32(self.min_throughput);
            writer.next().write_u32(self.max_height);
            writer.next().write_u32(self.max_mcs_pdu_size);
            writer.next().write_u32(self.protocol_version);
        })
    }

    fn read(reader: BERReader) -> ASN1Result<Self> {
        reader.read_sequence(|reader| {
            Ok(DomainParameters {
                max_channel_ids: reader.next().read_u32()?,
                max_user_ids: reader.next().read_u32()?,
                max_token_ids: reader.next().read_u32()?,
                num_priorities: reader.next().read_u32()?,
                min_throughput: reader.next().read_u32()?,
                max_height: reader.next().read_u32()?,
                max_mcs_pdu_size: reader.next().read_u32()?,
                protocol_version: reader.next().read_u32()?,
            })
        })
    }
}

/// Connect-Initial, carries the GCC conference create request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInitial {
    pub target: DomainParameters,
    pub minimum: DomainParameters,
    pub maximum: DomainParameters,
    pub user_data: Vec<u8>,
}

impl ConnectInitial {
    pub fn new(user_data: Vec<u8>) -> Self {
        ConnectInitial {
            target: DomainParameters::target(),
            minimum: DomainParameters::minimum(),
            maximum: DomainParameters::maximum(),
            user_data,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        yasna::construct_der(|writer| {
            writer.write_tagged_implicit(CONNECT_INITIAL, |writer| {
                writer.write_sequence(|writer| {
                    // calling and called domain selectors
                    writer.next().write_bytes(&[0x01]);
                    writer.next().write_bytes(&[0x01]);
                    // upward flag
                    writer.next().write_bool(true);
                    self.target.write(writer.next());
                    self.minimum.write(writer.next());
                    self.maximum.write(writer.next());
                    writer.next().write_bytes(&self.user_data);
                })
            })
        })
    }

    pub fn from_bytes(data: &[u8]) -> RdpResult<Self> {
        Ok(yasna::parse_ber(data, |reader| {
            reader.read_tagged_implicit(CONNECT_INITIAL, |reader| {
                reader.read_sequence(|reader| {
                    reader.next().read_bytes()?;
                    reader.next().read_bytes()?;
                    reader.next().read_bool()?;
                    Ok(ConnectInitial {
                        target: DomainParameters::read(reader.next())?,
                        minimum: DomainParameters::read(reader.next())?,
                        maximum: DomainParameters::read(reader.next())?,
                        user_data: reader.next().read_bytes()?,
                    })
                })
            })
        })?)
    }
}

/// Connect-Response, carries the GCC conference create response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub result: u8,
    pub called_connect_id: u32,
    pub parameters: DomainParameters,
    pub user_data: Vec<u8>,
}

impl ConnectResponse {
    pub fn new(user_data: Vec<u8>) -> Self {
        ConnectResponse {
            result: McsResult::RtSuccessful as u8,
            called_connect_id: 0,
            parameters: DomainParameters::negotiated(),
            user_data,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        yasna::construct_der(|writer| {
            writer.write_tagged_implicit(CONNECT_RESPONSE, |writer| {
                writer.write_sequence(|writer| {
                    writer.next().write_enum(self.result as i64);
                    writer.next().write_u32(self.called_connect_id);
                    self.parameters.write(writer.next());
                    writer.next().write_bytes(&self.user_data);
                })
            })
        })
    }

    pub fn from_bytes(data: &[u8]) -> RdpResult<Self> {
        Ok(yasna::parse_ber(data, |reader| {
            reader.read_tagged_implicit(CONNECT_RESPONSE, |reader| {
                reader.read_sequence(|reader| {
                    let result = reader.next().read_enum()?;
                    Ok(ConnectResponse {
                        result: u8::try_from(result).unwrap_or(u8::MAX),
                        called_connect_id: reader.next().read_u32()?,
                        parameters: DomainParameters::read(reader.next())?,
                        user_data: reader.next().read_bytes()?,
                    })
                })
            })
        })?)
    }
}

/// PER encoded domain PDUs exchanged once the domain is connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPdu {
    ErectDomainRequest,
    DisconnectProviderUltimatum {
        reason: u8,
    },
    AttachUserRequest,
    /// `user_id` is the decoded user channel id
    AttachUserConfirm {
        result: u8,
        user_id: Option<u16>,
    },
    ChannelJoinRequest {
        user_id: u16,
        channel_id: u16,
    },
    ChannelJoinConfirm {
        result: u8,
        user_id: u16,
        requested: u16,
        channel_id: Option<u16>,
    },
    SendDataRequest {
        user_id: u16,
        channel_id: u16,
        data: Vec<u8>,
    },
    SendDataIndication {
        user_id: u16,
        channel_id: u16,
        data: Vec<u8>,
    },
}

impl DomainPdu {
    pub fn kind(&self) -> DomainMcsPdu {
        match self {
            DomainPdu::ErectDomainRequest => DomainMcsPdu::ErectDomainRequest,
            DomainPdu::DisconnectProviderUltimatum { .. } => {
                DomainMcsPdu::DisconnectProviderUltimatum
            }
            DomainPdu::AttachUserRequest => DomainMcsPdu::AttachUserRequest,
            DomainPdu::AttachUserConfirm { .. } => DomainMcsPdu::AttachUserConfirm,
            DomainPdu::ChannelJoinRequest { .. } => DomainMcsPdu::ChannelJoinRequest,
            DomainPdu::ChannelJoinConfirm { .. } => DomainMcsPdu::ChannelJoinConfirm,
            DomainPdu::SendDataRequest { .. } => DomainMcsPdu::SendDataRequest,
            DomainPdu::SendDataIndication { .. } => DomainMcsPdu::SendDataIndication,
        }
    }

    fn opcode(&self, optional: bool) -> u8 {
        ((self.kind() as u8) << 2) | if optional { 2 } else { 0 }
    }

    /// # Example
    /// ```
    /// use rdp::core::mcs::DomainPdu;
    /// assert_eq!(DomainPdu::ErectDomainRequest.to_bytes().unwrap(), [0x04, 1, 0, 1, 0]);
    /// assert_eq!(DomainPdu::AttachUserRequest.to_bytes().unwrap(), [0x28]);
    /// ```
    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let message: Box<dyn Message> = match self {
            DomainPdu::ErectDomainRequest => Box::new(trame![
                self.opcode(false),
                per::write_integer(0),
                per::write_integer(0)
            ]),
            DomainPdu::DisconnectProviderUltimatum { reason } => Box::new(trame![
                self.opcode(false) | ((reason >> 1) & 0x03),
                (reason & 1) << 7
            ]),
            DomainPdu::AttachUserRequest => Box::new(trame![self.opcode(false)]),
            DomainPdu::AttachUserConfirm { result, user_id } => match user_id {
                Some(id) => Box::new(trame![
                    self.opcode(true),
                    *result,
                    per::write_integer_16(*id, MCS_USERCHANNEL_BASE)?
                ]),
                None => Box::new(trame![self.opcode(false), *result]),
            },
            DomainPdu::ChannelJoinRequest {
                user_id,
                channel_id,
            } => Box::new(trame![
                self.opcode(false),
                per::write_integer_16(*user_id, MCS_USERCHANNEL_BASE)?,
                U16::BE(*channel_id)
            ]),
            DomainPdu::ChannelJoinConfirm {
                result,
                user_id,
                requested,
                channel_id,
            } => {
                let mut message = trame![
                    self.opcode(channel_id.is_some()),
                    *result,
                    per::write_integer_16(*user_id, MCS_USERCHANNEL_BASE)?,
                    U16::BE(*requested)
                ];
                if let Some(id) = channel_id {
                    message.push(Box::new(U16::BE(*id)));
                }
                Box::new(message)
            }
            DomainPdu::SendDataRequest {
                user_id,
                channel_id,
                data,
            }
            | DomainPdu::SendDataIndication {
                user_id,
                channel_id,
                data,
            } => {
                if data.len() > 0x7fff {
                    return Err(Error::RdpError(RdpError::new(
                        RdpErrorKind::InvalidSize,
                        "MCS: send data payload too large",
                    )));
                }
                Box::new(trame![
                    self.opcode(false),
                    per::write_integer_16(*user_id, MCS_USERCHANNEL_BASE)?,
                    U16::BE(*channel_id),
                    SEND_DATA_FLAGS,
                    per::write_length(data.len() as u16),
                    data.clone()
                ])
            }
        };
        to_vec(message.as_ref())
    }

    pub fn from_bytes(data: &[u8]) -> RdpResult<Self> {
        let mut stream = Cursor::new(data);
        let header = stream.read_u8()?;
        let kind = DomainMcsPdu::try_from(header >> 2).map_err(|_| {
            Error::RdpError(RdpError::new(
                RdpErrorKind::UnknownPdu,
                &format!("MCS: unknown domain PDU {}", header >> 2),
            ))
        })?;
        let optional = header & 2 != 0;
        Ok(match kind {
            DomainMcsPdu::ErectDomainRequest => {
                for _ in 0..2 {
                    let left = remaining(&stream);
                    let size = per::read_bounded_length(&mut stream, left)?;
                    read_slice(&mut stream, size)?;
                }
                DomainPdu::ErectDomainRequest
            }
            DomainMcsPdu::DisconnectProviderUltimatum => {
                let low = stream.read_u8()?;
                DomainPdu::DisconnectProviderUltimatum {
                    reason: ((header & 0x03) << 1) | (low >> 7),
                }
            }
            DomainMcsPdu::AttachUserRequest => DomainPdu::AttachUserRequest,
            DomainMcsPdu::AttachUserConfirm => DomainPdu::AttachUserConfirm {
                result: per::read_enumerates(&mut stream)?,
                user_id: if optional {
                    Some(per::read_integer_16(&mut stream, MCS_USERCHANNEL_BASE)?)
                } else {
                    None
                },
            },
            DomainMcsPdu::ChannelJoinRequest => DomainPdu::ChannelJoinRequest {
                user_id: per::read_integer_16(&mut stream, MCS_USERCHANNEL_BASE)?,
                channel_id: stream.read_u16::<BigEndian>()?,
            },
            DomainMcsPdu::ChannelJoinConfirm => DomainPdu::ChannelJoinConfirm {
                result: per::read_enumerates(&mut stream)?,
                user_id: per::read_integer_16(&mut stream, MCS_USERCHANNEL_BASE)?,
                requested: stream.read_u16::<BigEndian>()?,
                channel_id: if optional {
                    Some(stream.read_u16::<BigEndian>()?)
                } else {
                    None
                },
            },
            DomainMcsPdu::SendDataRequest | DomainMcsPdu::SendDataIndication => {
                let user_id = per::read_integer_16(&mut stream, MCS_USERCHANNEL_BASE)?;
                let channel_id = stream.read_u16::<BigEndian>()?;
                let _flags = stream.read_u8()?;
                let left = remaining(&stream);
                let size = per::read_bounded_length(&mut stream, left)?;
                let data = read_slice(&mut stream, size)?.to_vec();
                if kind == DomainMcsPdu::SendDataRequest {
                    DomainPdu::SendDataRequest {
                        user_id,
                        channel_id,
                        data,
                    }
                } else {
                    DomainPdu::SendDataIndication {
                        user_id,
                        channel_id,
                        data,
                    }
                }
            }
        })
    }
}

/// Progress of the channel negotiation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum McsState {
    Idle,
    /// X224 connection confirmed
    Confirmed,
    DomainJoined,
    UserAttached,
    /// Number of channels joined so far
    ChannelsJoined(usize),
    Ready,
}

/// MCS client, owns the X224 layer
pub struct Client<C> {
    x224: x224::Client<C>,
    state: McsState,
    user_id: Option<u16>,
    /// Channel name to channel id, in join order
    channels: IndexMap<String, u16>,
    server_data: Option<gcc::ServerData>,
}

impl<C: ByteChannel> Client<C> {
    pub fn new(x224: x224::Client<C>) -> Self {
        Client {
            x224,
            state: McsState::Confirmed,
            user_id: None,
            channels: IndexMap::new(),
            server_data: None,
        }
    }

    /// Exchange the conference user data then attach and join every channel.
    ///
    /// On failure a disconnect request is sent before returning the error,
    /// the client must not be used afterwards.
    pub fn open(&mut self, client_data: &gcc::ClientData) -> RdpResult<gcc::ServerData> {
        match self.open_sequence(client_data) {
            Ok(server_data) => Ok(server_data),
            Err(e) => {
                if let Err(close) = self.x224.disconnect() {
                    debug!("MCS: disconnect after failure: {}", close);
                }
                Err(e)
            }
        }
    }

    fn open_sequence(&mut self, client_data: &gcc::ClientData) -> RdpResult<gcc::ServerData> {
        self.expect_state(McsState::Confirmed)?;
        check_channel_names(&client_data.network.channels)?;
        let server_data = self.connect_initial(client_data)?;

        let requested = &client_data.network.channels;
        if server_data.network.channel_ids.len() < requested.len() {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidRespond,
                &format!(
                    "MCS: {} channels requested, {} assigned",
                    requested.len(),
                    server_data.network.channel_ids.len()
                ),
            )));
        }

        self.erect_domain()?;
        let user_id = self.attach_user()?;

        let mut joins = vec![
            (USER_CHANNEL_NAME.to_string(), user_id),
            (GLOBAL_CHANNEL_NAME.to_string(), GLOBAL_CHANNEL_ID),
        ];
        joins.extend(
            requested
                .iter()
                .zip(server_data.network.channel_ids.iter())
                .map(|(def, id)| (def.name.clone(), *id)),
        );
        self.join_channels(&joins)?;
        self.state = McsState::Ready;
        info!(channels = self.channels.len(), "MCS: ready");

        self.server_data = Some(server_data.clone());
        Ok(server_data)
    }

    fn expect_state(&self, expected: McsState) -> RdpResult<()> {
        if self.state != expected {
            return Err(Error::RdpError(RdpError::new(
                RdpErrorKind::InvalidAutomata,
                &format!("MCS: expected state {:?}, found {:?}", expected, self.state),
            )));
        }
        Ok(())
    }

    /// Send the connect initial and parse the server user data of the response
    pub fn connect_initial(&mut self, client_data: &gcc::ClientData) -> RdpResult<gcc::ServerData> {
        let user_data = gcc::write_conference_create_request(&client_data.to_bytes()?)?;
        self.x224.write(&ConnectInitial::new(user_data).to_bytes())?;

        let response = ConnectResponse::from_bytes(&self.x224.read()?)?;
        check_result(response.result, "connect initial")?;
        debug!(parameters = ?response.parameters, "MCS: connect response");
        gcc::ServerData::from_bytes(&gcc::read_conference_create_response(
            &response.user_data,
        )?)
    }

    pub fn erect_domain(&mut self) -> RdpResult<()> {
        self.x224.write(&DomainPdu::ErectDomainRequest.to_bytes()?)?;
        self.state = McsState::DomainJoined;
        Ok(())
    }

    /// Attach user round trip, returns the user channel id
    pub fn attach_user(&mut self) -> RdpResult<u16> {
        self.expect_state(McsState::DomainJoined)?;
        self.x224.write(&DomainPdu::AttachUserRequest.to_bytes()?)?;
        match self.read_domain_pdu()? {
            DomainPdu::AttachUserConfirm { result, user_id } => {
                check_result(result, "attach user")?;
                let user_id = try_option!(user_id, "MCS: attach user confirm without user id")?;
                trace!(user_id, "MCS: user attached");
                self.user_id = Some(user_id);
                self.state = McsState::UserAttached;
                Ok(user_id)
            }
            other => Err(unexpected(DomainMcsPdu::AttachUserConfirm, &other)),
        }
    }

    /// Join each channel in order, stopping on the first refusal
    pub fn join_channels(&mut self, joins: &[(String, u16)]) -> RdpResult<()> {
        let user_id = try_option!(self.user_id, "MCS: no user attached")?;
        for (name, channel_id) in joins {
            if self.channels.contains_key(name) {
                return Err(duplicate_channel(name));
            }
            self.x224.write(
                &DomainPdu::ChannelJoinRequest {
                    user_id,
                    channel_id: *channel_id,
                }
                .to_bytes()?,
            )?;
            match self.read_domain_pdu()? {
                DomainPdu::ChannelJoinConfirm {
                    result, requested, ..
                } => {
                    check_result(result, &format!("join of channel {}", name))?;
                    if requested != *channel_id {
                        return Err(Error::RdpError(RdpError::new(
                            RdpErrorKind::InvalidRespond,
                            &format!(
                                "MCS: confirm for channel {} while joining {}",
                                requested, channel_id
                            ),
                        )));
                    }
                }
                other => return Err(unexpected(DomainMcsPdu::ChannelJoinConfirm, &other)),
            }
            trace!(name = name.as_str(), channel_id, "MCS: channel joined");
            self.channels.insert(name.clone(), *channel_id);
            self.state = McsState::ChannelsJoined(self.channels.len());
        }
        Ok(())
    }

    fn read_domain_pdu(&mut self) -> RdpResult<DomainPdu> {
        match DomainPdu::from_bytes(&self.x224.read()?)? {
            DomainPdu::DisconnectProviderUltimatum { reason } => Err(Error::RdpError(
                RdpError::new(
                    RdpErrorKind::Disconnect,
                    &format!("MCS: disconnect provider ultimatum, reason {}", reason),
                ),
            )),
            pdu => Ok(pdu),
        }
    }

    /// Send a message on a joined channel
    pub fn write(&mut self, channel_name: &str, message: &dyn Message) -> RdpResult<()> {
        let user_id = try_option!(self.user_id, "MCS: no user attached")?;
        let channel_id = *try_option!(
            self.channels.get(channel_name),
            &format!("MCS: unknown channel {}", channel_name)
        )?;
        self.x224.write(
            &DomainPdu::SendDataRequest {
                user_id,
                channel_id,
                data: to_vec(message)?,
            }
            .to_bytes()?,
        )
    }

    /// Read the next message sent by the server, with its channel name
    pub fn read(&mut self) -> RdpResult<(String, Vec<u8>)> {
        match self.read_domain_pdu()? {
            DomainPdu::SendDataIndication {
                channel_id, data, ..
            } => match self.channel_name(channel_id) {
                Some(name) => Ok((name.to_string(), data)),
                None => {
                    warn!(channel_id, "MCS: data on a channel never joined");
                    Err(Error::RdpError(RdpError::new(
                        RdpErrorKind::InvalidData,
                        &format!("MCS: data on unknown channel {}", channel_id),
                    )))
                }
            },
            other => Err(unexpected(DomainMcsPdu::SendDataIndication, &other)),
        }
    }

    pub fn channel_name(&self, channel_id: u16) -> Option<&str> {
        self.channels
            .iter()
            .find(|(_, id)| **id == channel_id)
            .map(|(name, _)| name.as_str())
    }

    /// Joined channels, in join order
    pub fn channels(&self) -> &IndexMap<String, u16> {
        &self.channels
    }

    pub fn state(&self) -> McsState {
        self.state
    }

    pub fn user_id(&self) -> Option<u16> {
        self.user_id
    }

    pub fn is_rdp_version_5_plus(&self) -> bool {
        self.server_data
            .as_ref()
            .map(|data| data.core.is_rdp_version_5_plus())
            .unwrap_or(false)
    }

    /// Best effort provider ultimatum then X224 disconnect
    pub fn disconnect(&mut self) -> RdpResult<()> {
        let ultimatum = DomainPdu::DisconnectProviderUltimatum {
            reason: DISCONNECT_REASON_PROVIDER,
        };
        if self.state == McsState::Ready {
            if let Err(e) = ultimatum
                .to_bytes()
                .and_then(|pdu| self.x224.write(&pdu))
            {
                debug!("MCS: ultimatum not sent: {}", e);
            }
        }
        self.state = McsState::Idle;
        self.x224.disconnect()
    }
}

fn duplicate_channel(name: &str) -> Error {
    Error::RdpError(RdpError::new(
        RdpErrorKind::InvalidData,
        &format!("MCS: channel {} requested twice", name),
    ))
}

/// Channels are addressed by name, every requested name must be unique
/// and distinct from the user and global channels
fn check_channel_names(channels: &[gcc::ChannelDef]) -> RdpResult<()> {
    let mut seen = vec![USER_CHANNEL_NAME, GLOBAL_CHANNEL_NAME];
    for channel in channels {
        if seen.contains(&channel.name.as_str()) {
            return Err(duplicate_channel(&channel.name));
        }
        seen.push(&channel.name);
    }
    Ok(())
}

fn unexpected(expected: DomainMcsPdu, received: &DomainPdu) -> Error {
    Error::RdpError(RdpError::new(
        RdpErrorKind::InvalidRespond,
        &format!("MCS: expected {:?}, received {:?}", expected, received.kind()),
    ))
}
