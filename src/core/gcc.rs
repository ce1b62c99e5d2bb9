use crate::core::cert::ServerCertificate;
use crate::core::per;
use crate::model::data::{read_slice, remaining, to_vec, U16, U32};
use crate::model::error::{Error, RdpError, RdpErrorKind, RdpResult};
use crate::model::unicode::{from_unicode, to_fixed_unicode};
use byteorder::{LittleEndian, ReadBytesExt};
use num_enum::TryFromPrimitive;
use std::convert::TryFrom;
use std::io::Cursor;
use tracing::{debug, warn};

/// T.124 object identifier prefix of every conference create PDU
const T124_02_98_OID: [u8; 7] = [0x00, 0x05, 0x00, 0x14, 0x7c, 0x00, 0x01];
/// Conference create request header, after the object identifier
const CONFERENCE_REQUEST_HEADER: [u8; 8] = [0x00, 0x08, 0x00, 0x10, 0x00, 0x01, 0xc0, 0x00];
/// Conference create response header, after the object identifier
const CONFERENCE_RESPONSE_HEADER: [u8; 9] = [0x14, 0x76, 0x0a, 0x01, 0x01, 0x00, 0x01, 0xc0, 0x00];
/// H.221 non standard keys
const H221_CS_KEY: &[u8; 4] = b"Duca";
const H221_SC_KEY: &[u8; 4] = b"McDn";

/// tag + length
pub const BLOCK_HEADER_SIZE: usize = 4;

/// Mandatory part of the client core block, header included
pub const CLIENT_CORE_MANDATORY_SIZE: usize = 132;

pub const SERVER_RANDOM_SIZE: usize = 32;

/// First channel id handed out for requested channels
pub const GLOBAL_CHANNEL_ID: u16 = 1003;

/// User data block types
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum MessageType {
    CsCore = 0xC001,
    CsSecurity = 0xC002,
    CsNet = 0xC003,
    CsCluster = 0xC004,
    ScCore = 0x0C01,
    ScSecurity = 0x0C02,
    ScNet = 0x0C03,
}

/// Legacy color depth codes
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum ColorDepth {
    RnsUd4Bpp = 0xCA00,
    RnsUd8Bpp = 0xCA01,
    RnsUd15Bpp = 0xCA02,
    RnsUd16Bpp = 0xCA03,
    RnsUd24Bpp = 0xCA04,
}

impl ColorDepth {
    pub fn bits_per_pixel(self) -> u16 {
        match self {
            ColorDepth::RnsUd4Bpp => 4,
            ColorDepth::RnsUd8Bpp => 8,
            ColorDepth::RnsUd15Bpp => 15,
            ColorDepth::RnsUd16Bpp => 16,
            ColorDepth::RnsUd24Bpp => 24,
        }
    }

    pub fn from_bits_per_pixel(bpp: u16) -> Option<Self> {
        match bpp {
            4 => Some(ColorDepth::RnsUd4Bpp),
            8 => Some(ColorDepth::RnsUd8Bpp),
            15 => Some(ColorDepth::RnsUd15Bpp),
            16 => Some(ColorDepth::RnsUd16Bpp),
            24 => Some(ColorDepth::RnsUd24Bpp),
            _ => None,
        }
    }
}

#[repr(u16)]
#[allow(dead_code)]
enum Sequence {
    RnsUdSasDel = 0xAA03,
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Version {
    RdpVersion4 = 0x00080001,
    RdpVersion5Plus = 0x00080004,
}

/// Keyboard layouts
pub const KBD_LAYOUT_FRENCH: u32 = 0x040C;
pub const KBD_LAYOUT_US: u32 = 0x0409;

/// IBM enhanced keyboard
const KEYBOARD_TYPE_IBM_101_102_KEYS: u32 = 0x00000004;

/// Supported color depth flags
pub const RNS_UD_24BPP_SUPPORT: u16 = 0x0001;
pub const RNS_UD_16BPP_SUPPORT: u16 = 0x0002;
pub const RNS_UD_15BPP_SUPPORT: u16 = 0x0004;
pub const RNS_UD_32BPP_SUPPORT: u16 = 0x0008;

/// Early capability flags
pub const RNS_UD_CS_SUPPORT_ERRINFO_PDU: u16 = 0x0001;
pub const RNS_UD_CS_WANT_32BPP_SESSION: u16 = 0x0002;
pub const RNS_UD_CS_SUPPORT_STATUSINFO_PDU: u16 = 0x0004;
pub const RNS_UD_CS_STRONG_ASYMMETRIC_KEYS: u16 = 0x0008;
pub const RNS_UD_CS_VALID_CONNECTION_TYPE: u16 = 0x0020;
pub const RNS_UD_CS_SUPPORT_MONITOR_LAYOUT_PDU: u16 = 0x0040;
/// Bits no known capability uses
const EARLY_CAPABILITY_UNKNOWN_MASK: u16 = 0xFF10;

/// Cluster flags
pub const REDIRECTION_SUPPORTED: u32 = 0x00000001;
pub const REDIRECTED_SESSIONID_FIELD_VALID: u32 = 0x00000002;
pub const REDIRECTED_SMARTCARD: u32 = 0x00000040;
const REDIRECTION_VERSION_MASK: u32 = 0x0000003C;
const REDIRECTION_VERSION3: u32 = 0x02;

/// Encryption methods
pub const ENCRYPTION_FLAG_40BIT: u32 = 0x00000001;
pub const ENCRYPTION_FLAG_128BIT: u32 = 0x00000002;
pub const ENCRYPTION_FLAG_56BIT: u32 = 0x00000008;
pub const FIPS_ENCRYPTION_FLAG: u32 = 0x00000010;

/// Encryption levels
pub const ENCRYPTION_LEVEL_NONE: u32 = 0;
pub const ENCRYPTION_LEVEL_LOW: u32 = 1;
pub const ENCRYPTION_LEVEL_CLIENT_COMPATIBLE: u32 = 2;
pub const ENCRYPTION_LEVEL_HIGH: u32 = 3;
pub const ENCRYPTION_LEVEL_FIPS: u32 = 4;

/// Channel options
pub const CHANNEL_OPTION_INITIALIZED: u32 = 0x80000000;
pub const CHANNEL_OPTION_ENCRYPT_RDP: u32 = 0x40000000;
pub const CHANNEL_OPTION_ENCRYPT_SC: u32 = 0x20000000;
pub const CHANNEL_OPTION_ENCRYPT_CS: u32 = 0x10000000;
pub const CHANNEL_OPTION_PRI_HIGH: u32 = 0x08000000;
pub const CHANNEL_OPTION_PRI_MED: u32 = 0x04000000;
pub const CHANNEL_OPTION_PRI_LOW: u32 = 0x02000000;
pub const CHANNEL_OPTION_COMPRESS_RDP: u32 = 0x00800000;
pub const CHANNEL_OPTION_COMPRESS: u32 = 0x00400000;
pub const CHANNEL_OPTION_SHOW_PROTOCOL: u32 = 0x00200000;

/// Size of a channel name on the wire, NUL included
pub const CHANNEL_NAME_SIZE: usize = 8;

fn size_error(message: &str) -> Error {
    Error::RdpError(RdpError::new(RdpErrorKind::InvalidSize, message))
}

/// Blocks shorter than their mandatory fields are rejected
fn check_body_size(body: &[u8], size: usize, block: &str) -> RdpResult<()> {
    if body.len() < size {
        return Err(size_error(&format!(
            "GCC: {} block holds {} bytes, {} required",
            block,
            body.len(),
            size
        )));
    }
    Ok(())
}

/// Prefix a block body with its tag and length
fn write_block(kind: MessageType, body: Vec<u8>) -> RdpResult<Vec<u8>> {
    let length = body.len() + BLOCK_HEADER_SIZE;
    if length > u16::MAX as usize {
        return Err(size_error("GCC: user data block too large"));
    }
    to_vec(&trame![U16::LE(kind as u16), U16::LE(length as u16), body])
}

/// Split a user data payload into its blocks.
///
/// The declared length of each block is checked against the bytes left,
/// the slices returned do not include the block header.
pub fn read_blocks(data: &[u8]) -> RdpResult<Vec<(u16, &[u8])>> {
    let mut stream = Cursor::new(data);
    let mut blocks = Vec::new();
    while remaining(&stream) >= BLOCK_HEADER_SIZE {
        let tag = stream.read_u16::<LittleEndian>()?;
        let length = stream.read_u16::<LittleEndian>()? as usize;
        if length < BLOCK_HEADER_SIZE || length - BLOCK_HEADER_SIZE > remaining(&stream) {
            return Err(size_error(&format!(
                "GCC: block {:#06x} declares {} bytes",
                tag, length
            )));
        }
        blocks.push((tag, read_slice(&mut stream, length - BLOCK_HEADER_SIZE)?));
    }
    if remaining(&stream) != 0 {
        warn!(size = remaining(&stream), "GCC: trailing bytes after user data blocks");
    }
    Ok(blocks)
}

/// Client core data, identity and display parameters.
///
/// Fields after `ime_file_name` are optional on the wire,
/// a block too short to hold them decodes them as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCoreData {
    pub version: u32,
    pub desktop_width: u16,
    pub desktop_height: u16,
    pub color_depth: u16,
    pub sas_sequence: u16,
    pub keyboard_layout: u32,
    pub client_build: u32,
    pub client_name: String,
    pub keyboard_type: u32,
    pub keyboard_subtype: u32,
    pub keyboard_fn_keys: u32,
    pub ime_file_name: String,
    pub post_beta2_color_depth: u16,
    pub client_product_id: u16,
    pub serial_number: u32,
    pub high_color_depth: u16,
    pub supported_color_depths: u16,
    pub early_capability_flags: u16,
    pub client_dig_product_id: Vec<u8>,
    pub connection_type: u8,
    pub pad1: u8,
    pub server_selected_protocol: u32,
}

impl ClientCoreData {
    pub fn new(
        width: u16,
        height: u16,
        bpp: u16,
        keyboard_layout: u32,
        client_name: &str,
        server_selected_protocol: u32,
    ) -> Self {
        let high_color_depth = match bpp {
            32 => 24,
            bpp => bpp,
        };
        ClientCoreData {
            version: Version::RdpVersion5Plus as u32,
            desktop_width: width,
            desktop_height: height,
            color_depth: ColorDepth::RnsUd8Bpp as u16,
            sas_sequence: Sequence::RnsUdSasDel as u16,
            keyboard_layout,
            client_build: 2600,
            client_name: client_name.to_string(),
            keyboard_type: KEYBOARD_TYPE_IBM_101_102_KEYS,
            keyboard_subtype: 0,
            keyboard_fn_keys: 12,
            ime_file_name: String::new(),
            post_beta2_color_depth: ColorDepth::RnsUd8Bpp as u16,
            client_product_id: 1,
            serial_number: 0,
            high_color_depth,
            supported_color_depths: RNS_UD_15BPP_SUPPORT
                | RNS_UD_16BPP_SUPPORT
                | RNS_UD_24BPP_SUPPORT,
            early_capability_flags: RNS_UD_CS_SUPPORT_ERRINFO_PDU,
            client_dig_product_id: vec![0; 64],
            connection_type: 0,
            pad1: 0,
            server_selected_protocol,
        }
    }

    /// Bits per pixel of the legacy color depth code, if known
    pub fn bits_per_pixel(&self) -> Option<u16> {
        ColorDepth::try_from(self.color_depth)
            .ok()
            .map(ColorDepth::bits_per_pixel)
    }

    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let mut dig_product_id = self.client_dig_product_id.clone();
        dig_product_id.resize(64, 0);
        write_block(
            MessageType::CsCore,
            to_vec(&component![
                "version" => U32::LE(self.version),
                "desktopWidth" => U16::LE(self.desktop_width),
                "desktopHeight" => U16::LE(self.desktop_height),
                "colorDepth" => U16::LE(self.color_depth),
                "sasSequence" => U16::LE(self.sas_sequence),
                "kbdLayout" => U32::LE(self.keyboard_layout),
                "clientBuild" => U32::LE(self.client_build),
                "clientName" => to_fixed_unicode(&self.client_name, 32),
                "keyboardType" => U32::LE(self.keyboard_type),
                "keyboardSubType" => U32::LE(self.keyboard_subtype),
                "keyboardFnKeys" => U32::LE(self.keyboard_fn_keys),
                "imeFileName" => to_fixed_unicode(&self.ime_file_name, 64),
                "postBeta2ColorDepth" => U16::LE(self.post_beta2_color_depth),
                "clientProductId" => U16::LE(self.client_product_id),
                "serialNumber" => U32::LE(self.serial_number),
                "highColorDepth" => U16::LE(self.high_color_depth),
                "supportedColorDepths" => U16::LE(self.supported_color_depths),
                "earlyCapabilityFlags" => U16::LE(self.early_capability_flags),
                "clientDigProductId" => dig_product_id,
                "connectionType" => self.connection_type,
                "pad1octet" => self.pad1,
                "serverSelectedProtocol" => U32::LE(self.server_selected_protocol)
            ])?,
        )
    }

    /// Decode a block body, header excluded
    pub fn from_body(body: &[u8]) -> RdpResult<Self> {
        if body.len() + BLOCK_HEADER_SIZE < CLIENT_CORE_MANDATORY_SIZE {
            return Err(size_error("GCC: client core block is truncated"));
        }
        let mut stream = Cursor::new(body);
        let mut core = ClientCoreData {
            version: stream.read_u32::<LittleEndian>()?,
            desktop_width: stream.read_u16::<LittleEndian>()?,
            desktop_height: stream.read_u16::<LittleEndian>()?,
            color_depth: stream.read_u16::<LittleEndian>()?,
            sas_sequence: stream.read_u16::<LittleEndian>()?,
            keyboard_layout: stream.read_u32::<LittleEndian>()?,
            client_build: stream.read_u32::<LittleEndian>()?,
            client_name: from_unicode(read_slice(&mut stream, 32)?),
            keyboard_type: stream.read_u32::<LittleEndian>()?,
            keyboard_subtype: stream.read_u32::<LittleEndian>()?,
            keyboard_fn_keys: stream.read_u32::<LittleEndian>()?,
            ime_file_name: from_unicode(read_slice(&mut stream, 64)?),
            post_beta2_color_depth: 0,
            client_product_id: 0,
            serial_number: 0,
            high_color_depth: 0,
            supported_color_depths: 0,
            early_capability_flags: 0,
            client_dig_product_id: vec![0; 64],
            connection_type: 0,
            pad1: 0,
            server_selected_protocol: 0,
        };
        if ColorDepth::try_from(core.color_depth).is_err() {
            warn!(code = core.color_depth, "GCC: unknown color depth");
        }
        core.read_optional(&mut stream)?;
        Ok(core)
    }

    /// Each optional field is read only if the declared length still holds it
    fn read_optional(&mut self, stream: &mut Cursor<&[u8]>) -> RdpResult<()> {
        if remaining(stream) < 2 {
            return Ok(());
        }
        self.post_beta2_color_depth = stream.read_u16::<LittleEndian>()?;
        if ColorDepth::try_from(self.post_beta2_color_depth).is_err() {
            warn!(code = self.post_beta2_color_depth, "GCC: unknown post beta2 color depth");
        }
        if remaining(stream) < 2 {
            return Ok(());
        }
        self.client_product_id = stream.read_u16::<LittleEndian>()?;
        if remaining(stream) < 4 {
            return Ok(());
        }
        self.serial_number = stream.read_u32::<LittleEndian>()?;
        if remaining(stream) < 2 {
            return Ok(());
        }
        self.high_color_depth = stream.read_u16::<LittleEndian>()?;
        if remaining(stream) < 2 {
            return Ok(());
        }
        self.supported_color_depths = stream.read_u16::<LittleEndian>()?;
        if remaining(stream) < 2 {
            return Ok(());
        }
        self.early_capability_flags = stream.read_u16::<LittleEndian>()?;
        if self.early_capability_flags & EARLY_CAPABILITY_UNKNOWN_MASK != 0 {
            warn!(
                flags = self.early_capability_flags,
                "GCC: unknown early capability flags"
            );
        }
        if remaining(stream) < 64 {
            return Ok(());
        }
        self.client_dig_product_id = read_slice(stream, 64)?.to_vec();
        if remaining(stream) < 1 {
            return Ok(());
        }
        self.connection_type = stream.read_u8()?;
        if remaining(stream) < 1 {
            return Ok(());
        }
        self.pad1 = stream.read_u8()?;
        if remaining(stream) < 4 {
            return Ok(());
        }
        self.server_selected_protocol = stream.read_u32::<LittleEndian>()?;
        Ok(())
    }
}

/// Cluster and redirection flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientClusterData {
    pub flags: u32,
    pub redirected_session_id: Option<u32>,
}

impl ClientClusterData {
    pub fn new(console_session: bool) -> Self {
        let mut flags = REDIRECTION_SUPPORTED | (REDIRECTION_VERSION3 << 2);
        if console_session {
            flags |= REDIRECTED_SESSIONID_FIELD_VALID;
        }
        ClientClusterData {
            flags,
            redirected_session_id: if console_session { Some(0) } else { None },
        }
    }

    pub fn redirection_supported(&self) -> bool {
        self.flags & REDIRECTION_SUPPORTED != 0
    }

    pub fn session_id_valid(&self) -> bool {
        self.flags & REDIRECTED_SESSIONID_FIELD_VALID != 0
    }

    pub fn smartcard(&self) -> bool {
        self.flags & REDIRECTED_SMARTCARD != 0
    }

    pub fn redirection_version(&self) -> u32 {
        (self.flags & REDIRECTION_VERSION_MASK) >> 2
    }

    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let mut body = to_vec(&U32::LE(self.flags))?;
        if let Some(id) = self.redirected_session_id {
            body.extend_from_slice(&id.to_le_bytes());
        }
        write_block(MessageType::CsCluster, body)
    }

    pub fn from_body(body: &[u8]) -> RdpResult<Self> {
        check_body_size(body, 4, "client cluster")?;
        let mut stream = Cursor::new(body);
        let flags = stream.read_u32::<LittleEndian>()?;
        let redirected_session_id = if remaining(&stream) >= 4 {
            Some(stream.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        Ok(ClientClusterData {
            flags,
            redirected_session_id,
        })
    }
}

/// Accepted encryption methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSecurityData {
    pub encryption_methods: u32,
    /// Only used by french locale clients
    pub ext_encryption_methods: u32,
}

impl ClientSecurityData {
    pub fn new(encryption_methods: u32) -> Self {
        ClientSecurityData {
            encryption_methods,
            ext_encryption_methods: 0,
        }
    }

    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        write_block(
            MessageType::CsSecurity,
            to_vec(&trame![
                U32::LE(self.encryption_methods),
                U32::LE(self.ext_encryption_methods)
            ])?,
        )
    }

    pub fn from_body(body: &[u8]) -> RdpResult<Self> {
        check_body_size(body, 4, "client security")?;
        let mut stream = Cursor::new(body);
        let encryption_methods = stream.read_u32::<LittleEndian>()?;
        let ext_encryption_methods = if remaining(&stream) >= 4 {
            stream.read_u32::<LittleEndian>()?
        } else {
            0
        };
        Ok(ClientSecurityData {
            encryption_methods,
            ext_encryption_methods,
        })
    }
}

/// One requested static virtual channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDef {
    /// At most 7 ASCII characters
    pub name: String,
    pub options: u32,
}

impl ChannelDef {
    pub fn new(name: &str, options: u32) -> Self {
        ChannelDef {
            name: name.to_string(),
            options,
        }
    }
}

/// Requested channel list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientNetworkData {
    pub channels: Vec<ChannelDef>,
}

impl ClientNetworkData {
    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let mut body = to_vec(&U32::LE(self.channels.len() as u32))?;
        for channel in &self.channels {
            if channel.name.len() >= CHANNEL_NAME_SIZE || !channel.name.is_ascii() {
                return Err(Error::RdpError(RdpError::new(
                    RdpErrorKind::InvalidData,
                    &format!("GCC: invalid channel name {:?}", channel.name),
                )));
            }
            let mut name = channel.name.as_bytes().to_vec();
            name.resize(CHANNEL_NAME_SIZE, 0);
            body.extend_from_slice(&name);
            body.extend_from_slice(&channel.options.to_le_bytes());
        }
        write_block(MessageType::CsNet, body)
    }

    pub fn from_body(body: &[u8]) -> RdpResult<Self> {
        check_body_size(body, 4, "client network")?;
        let mut stream = Cursor::new(body);
        let count = stream.read_u32::<LittleEndian>()? as usize;
        if count.saturating_mul(CHANNEL_NAME_SIZE + 4) > remaining(&stream) {
            return Err(size_error(&format!(
                "GCC: {} channels do not fit the network block",
                count
            )));
        }
        let mut channels = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_slice(&mut stream, CHANNEL_NAME_SIZE)?;
            let end = name.iter().position(|&c| c == 0).unwrap_or(CHANNEL_NAME_SIZE);
            channels.push(ChannelDef {
                name: String::from_utf8_lossy(&name[..end]).into_owned(),
                options: stream.read_u32::<LittleEndian>()?,
            });
        }
        Ok(ClientNetworkData { channels })
    }
}

/// Every client block, in the order they are sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientData {
    pub core: ClientCoreData,
    pub cluster: Option<ClientClusterData>,
    pub security: ClientSecurityData,
    pub network: ClientNetworkData,
}

impl ClientData {
    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let mut result = self.core.to_bytes()?;
        if let Some(cluster) = &self.cluster {
            result.extend(cluster.to_bytes()?);
        }
        result.extend(self.security.to_bytes()?);
        result.extend(self.network.to_bytes()?);
        Ok(result)
    }

    pub fn from_bytes(data: &[u8]) -> RdpResult<Self> {
        let mut core = None;
        let mut cluster = None;
        let mut security = ClientSecurityData::new(0);
        let mut network = ClientNetworkData::default();
        for (tag, body) in read_blocks(data)? {
            match MessageType::try_from(tag) {
                Ok(MessageType::CsCore) => core = Some(ClientCoreData::from_body(body)?),
                Ok(MessageType::CsCluster) => cluster = Some(ClientClusterData::from_body(body)?),
                Ok(MessageType::CsSecurity) => security = ClientSecurityData::from_body(body)?,
                Ok(MessageType::CsNet) => network = ClientNetworkData::from_body(body)?,
                _ => warn!(tag, "GCC: skipping unknown client block"),
            }
            debug!(tag, size = body.len(), "GCC: client block");
        }
        Ok(ClientData {
            core: try_option!(core, "GCC: missing client core block")?,
            cluster,
            security,
            network,
        })
    }
}

/// Server core data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCoreData {
    pub version: u32,
    pub client_requested_protocols: Option<u32>,
    pub early_capability_flags: Option<u32>,
}

impl ServerCoreData {
    pub fn new(client_requested_protocols: u32) -> Self {
        ServerCoreData {
            version: Version::RdpVersion5Plus as u32,
            client_requested_protocols: Some(client_requested_protocols),
            early_capability_flags: Some(0),
        }
    }

    pub fn is_rdp_version_5_plus(&self) -> bool {
        self.version >= Version::RdpVersion5Plus as u32
    }

    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let mut body = to_vec(&U32::LE(self.version))?;
        if let Some(protocols) = self.client_requested_protocols {
            body.extend_from_slice(&protocols.to_le_bytes());
            if let Some(flags) = self.early_capability_flags {
                body.extend_from_slice(&flags.to_le_bytes());
            }
        }
        write_block(MessageType::ScCore, body)
    }

    pub fn from_body(body: &[u8]) -> RdpResult<Self> {
        check_body_size(body, 4, "server core")?;
        let mut stream = Cursor::new(body);
        let version = stream.read_u32::<LittleEndian>()?;
        let client_requested_protocols = if remaining(&stream) >= 4 {
            Some(stream.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        let early_capability_flags = if remaining(&stream) >= 4 {
            Some(stream.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        Ok(ServerCoreData {
            version,
            client_requested_protocols,
            early_capability_flags,
        })
    }
}

/// Server random and certificate, present when encryption is on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyInfo {
    pub server_random: Vec<u8>,
    pub certificate: ServerCertificate,
}

/// Selected encryption method and level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSecurityData {
    pub encryption_method: u32,
    pub encryption_level: u32,
    pub key_info: Option<ServerKeyInfo>,
}

impl ServerSecurityData {
    /// No standard RDP security
    pub fn none() -> Self {
        ServerSecurityData {
            encryption_method: 0,
            encryption_level: ENCRYPTION_LEVEL_NONE,
            key_info: None,
        }
    }

    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let mut body = to_vec(&trame![
            U32::LE(self.encryption_method),
            U32::LE(self.encryption_level)
        ])?;
        if let Some(info) = &self.key_info {
            let certificate = info.certificate.to_bytes()?;
            body.extend(to_vec(&trame![
                U32::LE(info.server_random.len() as u32),
                U32::LE(certificate.len() as u32)
            ])?);
            body.extend_from_slice(&info.server_random);
            body.extend(certificate);
        }
        write_block(MessageType::ScSecurity, body)
    }

    pub fn from_body(body: &[u8]) -> RdpResult<Self> {
        check_body_size(body, 8, "server security")?;
        let mut stream = Cursor::new(body);
        let encryption_method = stream.read_u32::<LittleEndian>()?;
        let encryption_level = stream.read_u32::<LittleEndian>()?;
        debug!(encryption_method, encryption_level, "GCC: server security");
        if encryption_level == ENCRYPTION_LEVEL_NONE {
            return Ok(ServerSecurityData {
                encryption_method,
                encryption_level,
                key_info: None,
            });
        }

        check_body_size(body, 16, "server security")?;
        let random_length = stream.read_u32::<LittleEndian>()? as usize;
        let certificate_length = stream.read_u32::<LittleEndian>()? as usize;
        if random_length != SERVER_RANDOM_SIZE {
            return Err(size_error(&format!(
                "GCC: invalid server random size {}",
                random_length
            )));
        }
        let server_random = read_slice(&mut stream, random_length)?.to_vec();
        if certificate_length > remaining(&stream) {
            return Err(size_error("GCC: server certificate exceeds the block"));
        }
        let certificate =
            ServerCertificate::from_bytes(read_slice(&mut stream, certificate_length)?)?;
        Ok(ServerSecurityData {
            encryption_method,
            encryption_level,
            key_info: Some(ServerKeyInfo {
                server_random,
                certificate,
            }),
        })
    }
}

/// Channel ids assigned by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNetworkData {
    pub io_channel: u16,
    pub channel_ids: Vec<u16>,
}

impl ServerNetworkData {
    /// Sequential ids following the global channel, in request order
    ///
    /// # Example
    /// ```
    /// use rdp::core::gcc::ServerNetworkData;
    /// assert_eq!(ServerNetworkData::assign(2).unwrap().channel_ids, [1004, 1005]);
    /// ```
    pub fn assign(count: usize) -> RdpResult<Self> {
        let last = u16::try_from(count)
            .ok()
            .and_then(|count| GLOBAL_CHANNEL_ID.checked_add(count))
            .ok_or_else(|| size_error(&format!("GCC: no channel id left for {} channels", count)))?;
        Ok(ServerNetworkData {
            io_channel: GLOBAL_CHANNEL_ID,
            channel_ids: (GLOBAL_CHANNEL_ID + 1..=last).collect(),
        })
    }

    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let mut body = to_vec(&trame![
            U16::LE(self.io_channel),
            U16::LE(self.channel_ids.len() as u16)
        ])?;
        for id in &self.channel_ids {
            body.extend_from_slice(&id.to_le_bytes());
        }
        if self.channel_ids.len() % 2 == 1 {
            body.extend_from_slice(&[0, 0]);
        }
        write_block(MessageType::ScNet, body)
    }

    pub fn from_body(body: &[u8]) -> RdpResult<Self> {
        check_body_size(body, 4, "server network")?;
        let mut stream = Cursor::new(body);
        let io_channel = stream.read_u16::<LittleEndian>()?;
        let count = stream.read_u16::<LittleEndian>()? as usize;
        if count * 2 > remaining(&stream) {
            return Err(size_error("GCC: channel ids exceed the network block"));
        }
        let mut channel_ids = Vec::with_capacity(count);
        for _ in 0..count {
            channel_ids.push(stream.read_u16::<LittleEndian>()?);
        }
        Ok(ServerNetworkData {
            io_channel,
            channel_ids,
        })
    }
}

/// Every server block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerData {
    pub core: ServerCoreData,
    pub security: ServerSecurityData,
    pub network: ServerNetworkData,
}

impl ServerData {
    pub fn to_bytes(&self) -> RdpResult<Vec<u8>> {
        let mut result = self.core.to_bytes()?;
        result.extend(self.security.to_bytes()?);
        result.extend(self.network.to_bytes()?);
        Ok(result)
    }

    pub fn from_bytes(data: &[u8]) -> RdpResult<Self> {
        let mut core = None;
        let mut security = ServerSecurityData::none();
        let mut network = None;
        for (tag, body) in read_blocks(data)? {
            match MessageType::try_from(tag) {
                Ok(MessageType::ScCore) => core = Some(ServerCoreData::from_body(body)?),
                Ok(MessageType::ScSecurity) => security = ServerSecurityData::from_body(body)?,
                Ok(MessageType::ScNet) => network = Some(ServerNetworkData::from_body(body)?),
                _ => warn!(tag, "GCC: skipping unknown server block"),
            }
            debug!(tag, size = body.len(), "GCC: server block");
        }
        Ok(ServerData {
            core: try_option!(core, "GCC: missing server core block")?,
            security,
            network: try_option!(network, "GCC: missing server network block")?,
        })
    }
}

fn per_length(length: usize) -> RdpResult<Vec<u8>> {
    if length > 0x7fff {
        return Err(size_error("GCC: user data too large for a PER length"));
    }
    to_vec(&per::write_length(length as u16))
}

/// Wrap client blocks into a conference create request
pub fn write_conference_create_request(user_data: &[u8]) -> RdpResult<Vec<u8>> {
    let inner = per_length(user_data.len())?;
    let mut result = T124_02_98_OID.to_vec();
    result.extend(per_length(
        CONFERENCE_REQUEST_HEADER.len() + H221_CS_KEY.len() + inner.len() + user_data.len(),
    )?);
    result.extend_from_slice(&CONFERENCE_REQUEST_HEADER);
    result.extend_from_slice(H221_CS_KEY);
    result.extend(inner);
    result.extend_from_slice(user_data);
    Ok(result)
}

/// Wrap server blocks into a conference create response
pub fn write_conference_create_response(user_data: &[u8]) -> RdpResult<Vec<u8>> {
    let inner = per_length(user_data.len())?;
    let mut result = T124_02_98_OID.to_vec();
    result.extend(per_length(
        CONFERENCE_RESPONSE_HEADER.len() + H221_SC_KEY.len() + inner.len() + user_data.len(),
    )?);
    result.extend_from_slice(&CONFERENCE_RESPONSE_HEADER);
    result.extend_from_slice(H221_SC_KEY);
    result.extend(inner);
    result.extend_from_slice(user_data);
    Ok(result)
}

fn read_conference_create(data: &[u8], header_size: usize, key: &[u8; 4]) -> RdpResult<Vec<u8>> {
    let mut stream = Cursor::new(data);
    if read_slice(&mut stream, T124_02_98_OID.len())? != T124_02_98_OID {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "GCC: unexpected T.124 object identifier",
        )));
    }
    let left = remaining(&stream);
    per::read_bounded_length(&mut stream, left)?;
    read_slice(&mut stream, header_size)?;
    if read_slice(&mut stream, key.len())? != key {
        return Err(Error::RdpError(RdpError::new(
            RdpErrorKind::InvalidData,
            "GCC: unexpected H.221 key",
        )));
    }
    let left = remaining(&stream);
    let length = per::read_bounded_length(&mut stream, left)?;
    Ok(read_slice(&mut stream, length)?.to_vec())
}

/// Extract client blocks from a conference create request
pub fn read_conference_create_request(data: &[u8]) -> RdpResult<Vec<u8>> {
    read_conference_create(data, CONFERENCE_REQUEST_HEADER.len(), H221_CS_KEY)
}

/// Extract server blocks from a conference create response
pub fn read_conference_create_response(data: &[u8]) -> RdpResult<Vec<u8>> {
    read_conference_create(data, CONFERENCE_RESPONSE_HEADER.len(), H221_SC_KEY)
}
