//! DHCPv4 message and options (RFC 2131 / RFC 2132)
use std::{collections::BTreeMap, fmt, net::Ipv4Addr};

use crate::{
    Decodable, Decoder, Encodable, Encoder,
    error::{DecodeError, DecodeResult, EncodeError, EncodeResult},
};

pub mod relay;

/// default DHCPv4 server port
pub const SERVER_PORT: u16 = 67;
/// default DHCPv4 client port
pub const CLIENT_PORT: u16 = 68;

/// magic cookie separating the fixed header from the options field
pub const MAGIC: u32 = 0x6382_5363;

const CHADDR_LEN: usize = 16;
const SNAME_LEN: usize = 64;
const FILE_LEN: usize = 128;

/// BOOTP opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    BootRequest,
    BootReply,
    Unknown(u8),
}

impl From<u8> for Opcode {
    fn from(n: u8) -> Self {
        match n {
            1 => Opcode::BootRequest,
            2 => Opcode::BootReply,
            n => Opcode::Unknown(n),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        match op {
            Opcode::BootRequest => 1,
            Opcode::BootReply => 2,
            Opcode::Unknown(n) => n,
        }
    }
}

/// header flags field. Only the broadcast bit is defined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    pub fn new(flags: u16) -> Self {
        Flags(flags)
    }
    /// broadcast bit set?
    pub fn broadcast(&self) -> bool {
        (self.0 & 0x8000) != 0
    }
    /// return flags with the broadcast bit set
    pub fn set_broadcast(self) -> Self {
        Flags(self.0 | 0x8000)
    }
    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// DHCP message type (option 53)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(n: u8) -> Self {
        use MessageType::*;
        match n {
            1 => Discover,
            2 => Offer,
            3 => Request,
            4 => Decline,
            5 => Ack,
            6 => Nak,
            7 => Release,
            8 => Inform,
            n => Unknown(n),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(m: MessageType) -> Self {
        use MessageType::*;
        match m {
            Discover => 1,
            Offer => 2,
            Request => 3,
            Decline => 4,
            Ack => 5,
            Nak => 6,
            Release => 7,
            Inform => 8,
            Unknown(n) => n,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// option codes the server understands. Codes it does not are carried
/// through as [`OptionCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionCode {
    Pad,
    SubnetMask,
    Router,
    DomainNameServer,
    Hostname,
    DomainName,
    BroadcastAddr,
    VendorExtensions,
    RequestedIpAddress,
    AddressLeaseTime,
    MessageType,
    ServerIdentifier,
    ParameterRequestList,
    Message,
    MaxMessageSize,
    Renewal,
    Rebinding,
    ClientIdentifier,
    ClassIdentifier,
    RapidCommit,
    RelayAgentInformation,
    SubnetSelection,
    VendorClass,
    VendorInfo,
    End,
    Unknown(u8),
}

impl From<u8> for OptionCode {
    fn from(n: u8) -> Self {
        use OptionCode::*;
        match n {
            0 => Pad,
            1 => SubnetMask,
            3 => Router,
            6 => DomainNameServer,
            12 => Hostname,
            15 => DomainName,
            28 => BroadcastAddr,
            43 => VendorExtensions,
            50 => RequestedIpAddress,
            51 => AddressLeaseTime,
            53 => MessageType,
            54 => ServerIdentifier,
            55 => ParameterRequestList,
            56 => Message,
            57 => MaxMessageSize,
            58 => Renewal,
            59 => Rebinding,
            61 => ClientIdentifier,
            60 => ClassIdentifier,
            80 => RapidCommit,
            82 => RelayAgentInformation,
            118 => SubnetSelection,
            124 => VendorClass,
            125 => VendorInfo,
            255 => End,
            n => Unknown(n),
        }
    }
}

impl From<OptionCode> for u8 {
    fn from(code: OptionCode) -> Self {
        use OptionCode::*;
        match code {
            Pad => 0,
            SubnetMask => 1,
            Router => 3,
            DomainNameServer => 6,
            Hostname => 12,
            DomainName => 15,
            BroadcastAddr => 28,
            VendorExtensions => 43,
            RequestedIpAddress => 50,
            AddressLeaseTime => 51,
            MessageType => 53,
            ServerIdentifier => 54,
            ParameterRequestList => 55,
            Message => 56,
            MaxMessageSize => 57,
            Renewal => 58,
            Rebinding => 59,
            ClientIdentifier => 61,
            ClassIdentifier => 60,
            RapidCommit => 80,
            RelayAgentInformation => 82,
            SubnetSelection => 118,
            VendorClass => 124,
            VendorInfo => 125,
            End => 255,
            Unknown(n) => n,
        }
    }
}

impl PartialOrd for OptionCode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OptionCode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        u8::from(*self).cmp(&u8::from(*other))
    }
}

/// a decoded DHCPv4 option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DomainNameServer(Vec<Ipv4Addr>),
    Hostname(String),
    DomainName(String),
    BroadcastAddr(Ipv4Addr),
    /// vendor-specific information (option 43). Kept raw at decode time;
    /// interpretation is deferred until the client's class is known.
    VendorExtensions(Vec<u8>),
    RequestedIpAddress(Ipv4Addr),
    AddressLeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<OptionCode>),
    Message(String),
    MaxMessageSize(u16),
    Renewal(u32),
    Rebinding(u32),
    ClientIdentifier(Vec<u8>),
    /// vendor class identifier (option 60), opaque bytes matched by client
    /// classification
    ClassIdentifier(Vec<u8>),
    RapidCommit,
    RelayAgentInformation(relay::RelayAgentInformation),
    SubnetSelection(Ipv4Addr),
    /// vendor-identifying vendor class (option 124), opaque
    VendorClass(Vec<u8>),
    /// vendor-identifying vendor info (option 125), opaque
    VendorInfo(Vec<u8>),
    Unknown(UnknownOption),
}

/// an option the server does not interpret, carried through verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl From<&DhcpOption> for OptionCode {
    fn from(opt: &DhcpOption) -> Self {
        use DhcpOption as O;
        match opt {
            O::SubnetMask(_) => OptionCode::SubnetMask,
            O::Router(_) => OptionCode::Router,
            O::DomainNameServer(_) => OptionCode::DomainNameServer,
            O::Hostname(_) => OptionCode::Hostname,
            O::DomainName(_) => OptionCode::DomainName,
            O::BroadcastAddr(_) => OptionCode::BroadcastAddr,
            O::VendorExtensions(_) => OptionCode::VendorExtensions,
            O::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            O::AddressLeaseTime(_) => OptionCode::AddressLeaseTime,
            O::MessageType(_) => OptionCode::MessageType,
            O::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            O::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            O::Message(_) => OptionCode::Message,
            O::MaxMessageSize(_) => OptionCode::MaxMessageSize,
            O::Renewal(_) => OptionCode::Renewal,
            O::Rebinding(_) => OptionCode::Rebinding,
            O::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            O::ClassIdentifier(_) => OptionCode::ClassIdentifier,
            O::RapidCommit => OptionCode::RapidCommit,
            O::RelayAgentInformation(_) => OptionCode::RelayAgentInformation,
            O::SubnetSelection(_) => OptionCode::SubnetSelection,
            O::VendorClass(_) => OptionCode::VendorClass,
            O::VendorInfo(_) => OptionCode::VendorInfo,
            O::Unknown(u) => OptionCode::Unknown(u.code),
        }
    }
}

fn read_ipv4_list(dec: &mut Decoder<'_>) -> DecodeResult<Vec<Ipv4Addr>> {
    let mut ips = Vec::with_capacity(dec.remaining() / 4);
    while dec.remaining() >= 4 {
        ips.push(dec.read_ipv4()?);
    }
    if !dec.is_empty() {
        return Err(DecodeError::Truncated);
    }
    Ok(ips)
}

fn read_string(dec: &mut Decoder<'_>, field: &'static str) -> DecodeResult<String> {
    let bytes = dec.read_slice(dec.remaining())?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidField { field })
}

impl DhcpOption {
    fn parse(code: u8, data: &[u8]) -> DecodeResult<Self> {
        use DhcpOption as O;
        let mut dec = Decoder::new(data);
        Ok(match OptionCode::from(code) {
            OptionCode::SubnetMask => O::SubnetMask(dec.read_ipv4()?),
            OptionCode::Router => O::Router(read_ipv4_list(&mut dec)?),
            OptionCode::DomainNameServer => O::DomainNameServer(read_ipv4_list(&mut dec)?),
            OptionCode::Hostname => O::Hostname(read_string(&mut dec, "hostname")?),
            OptionCode::DomainName => O::DomainName(read_string(&mut dec, "domain name")?),
            OptionCode::BroadcastAddr => O::BroadcastAddr(dec.read_ipv4()?),
            OptionCode::VendorExtensions => O::VendorExtensions(data.to_vec()),
            OptionCode::RequestedIpAddress => O::RequestedIpAddress(dec.read_ipv4()?),
            OptionCode::AddressLeaseTime => O::AddressLeaseTime(dec.read_u32()?),
            OptionCode::MessageType => O::MessageType(MessageType::from(dec.read_u8()?)),
            OptionCode::ServerIdentifier => O::ServerIdentifier(dec.read_ipv4()?),
            OptionCode::ParameterRequestList => {
                O::ParameterRequestList(data.iter().map(|&c| OptionCode::from(c)).collect())
            }
            OptionCode::Message => O::Message(read_string(&mut dec, "message")?),
            OptionCode::MaxMessageSize => O::MaxMessageSize(dec.read_u16()?),
            OptionCode::Renewal => O::Renewal(dec.read_u32()?),
            OptionCode::Rebinding => O::Rebinding(dec.read_u32()?),
            OptionCode::ClientIdentifier => O::ClientIdentifier(data.to_vec()),
            OptionCode::ClassIdentifier => O::ClassIdentifier(data.to_vec()),
            OptionCode::RapidCommit => O::RapidCommit,
            OptionCode::RelayAgentInformation => {
                O::RelayAgentInformation(relay::RelayAgentInformation::from_bytes(data)?)
            }
            OptionCode::SubnetSelection => O::SubnetSelection(dec.read_ipv4()?),
            OptionCode::VendorClass => O::VendorClass(data.to_vec()),
            OptionCode::VendorInfo => O::VendorInfo(data.to_vec()),
            _ => O::Unknown(UnknownOption {
                code,
                data: data.to_vec(),
            }),
        })
    }

    fn body(&self) -> EncodeResult<Vec<u8>> {
        use DhcpOption as O;
        let mut out = Vec::new();
        let mut enc = Encoder::new(&mut out);
        match self {
            O::SubnetMask(ip)
            | O::BroadcastAddr(ip)
            | O::RequestedIpAddress(ip)
            | O::ServerIdentifier(ip)
            | O::SubnetSelection(ip) => enc.write_ipv4(*ip)?,
            O::Router(ips) | O::DomainNameServer(ips) => {
                for ip in ips {
                    enc.write_ipv4(*ip)?;
                }
            }
            O::Hostname(s) | O::DomainName(s) | O::Message(s) => enc.write_slice(s.as_bytes())?,
            O::VendorExtensions(data)
            | O::ClientIdentifier(data)
            | O::ClassIdentifier(data)
            | O::VendorClass(data)
            | O::VendorInfo(data) => enc.write_slice(data)?,
            O::AddressLeaseTime(n) | O::Renewal(n) | O::Rebinding(n) => enc.write_u32(*n)?,
            O::MessageType(t) => enc.write_u8(u8::from(*t))?,
            O::ParameterRequestList(codes) => {
                for code in codes {
                    enc.write_u8(u8::from(*code))?;
                }
            }
            O::MaxMessageSize(n) => enc.write_u16(*n)?,
            O::RapidCommit => {}
            O::RelayAgentInformation(info) => enc.write_slice(&info.to_vec()?)?,
            O::Unknown(u) => enc.write_slice(&u.data)?,
        }
        Ok(out)
    }
}

/// the options field of a message, keyed by option code. At most one
/// option per code is kept; duplicate codes on the wire are resolved
/// last-wins and flagged on the [`Message`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpOptions(BTreeMap<OptionCode, DhcpOption>);

impl DhcpOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, code: OptionCode) -> Option<&DhcpOption> {
        self.0.get(&code)
    }
    /// insert an option, replacing any existing option of the same code
    pub fn insert(&mut self, opt: DhcpOption) -> Option<DhcpOption> {
        self.0.insert(OptionCode::from(&opt), opt)
    }
    pub fn remove(&mut self, code: OptionCode) -> Option<DhcpOption> {
        self.0.remove(&code)
    }
    pub fn clear(&mut self) {
        self.0.clear()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&OptionCode, &DhcpOption)> {
        self.0.iter()
    }
    /// the message type (option 53), if present
    pub fn msg_type(&self) -> Option<MessageType> {
        match self.get(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(t)) => Some(*t),
            _ => None,
        }
    }
    pub fn has_msg_type(&self, t: MessageType) -> bool {
        self.msg_type() == Some(t)
    }
}

/// A DHCPv4 message
///
/// Fixed header per RFC 2131 §2, followed by the magic cookie and option
/// TLVs. `PAD` is skipped on decode, `END` terminates the options field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    opcode: Opcode,
    htype: u8,
    hops: u8,
    xid: u32,
    secs: u16,
    flags: Flags,
    ciaddr: Ipv4Addr,
    yiaddr: Ipv4Addr,
    siaddr: Ipv4Addr,
    giaddr: Ipv4Addr,
    chaddr: Vec<u8>,
    sname: Vec<u8>,
    fname: Vec<u8>,
    opts: DhcpOptions,
    /// set when a duplicate option code was seen on decode (last one won)
    had_duplicate: bool,
}

impl Message {
    /// new BOOTREQUEST with xid 0
    pub fn new(
        ciaddr: Ipv4Addr,
        yiaddr: Ipv4Addr,
        siaddr: Ipv4Addr,
        giaddr: Ipv4Addr,
        chaddr: &[u8],
    ) -> Self {
        Self::new_with_id(0, ciaddr, yiaddr, siaddr, giaddr, chaddr)
    }

    /// new BOOTREQUEST with a given transaction id
    pub fn new_with_id(
        xid: u32,
        ciaddr: Ipv4Addr,
        yiaddr: Ipv4Addr,
        siaddr: Ipv4Addr,
        giaddr: Ipv4Addr,
        chaddr: &[u8],
    ) -> Self {
        Message {
            opcode: Opcode::BootRequest,
            htype: 1,
            hops: 0,
            xid,
            secs: 0,
            flags: Flags::default(),
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr: chaddr[..chaddr.len().min(CHADDR_LEN)].to_vec(),
            sname: Vec::new(),
            fname: Vec::new(),
            opts: DhcpOptions::new(),
            had_duplicate: false,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }
    pub fn set_opcode(&mut self, opcode: Opcode) -> &mut Self {
        self.opcode = opcode;
        self
    }
    pub fn htype(&self) -> u8 {
        self.htype
    }
    pub fn set_htype(&mut self, htype: u8) -> &mut Self {
        self.htype = htype;
        self
    }
    pub fn hops(&self) -> u8 {
        self.hops
    }
    pub fn xid(&self) -> u32 {
        self.xid
    }
    pub fn secs(&self) -> u16 {
        self.secs
    }
    pub fn flags(&self) -> Flags {
        self.flags
    }
    pub fn set_flags(&mut self, flags: Flags) -> &mut Self {
        self.flags = flags;
        self
    }
    pub fn ciaddr(&self) -> Ipv4Addr {
        self.ciaddr
    }
    pub fn yiaddr(&self) -> Ipv4Addr {
        self.yiaddr
    }
    pub fn set_yiaddr<I: Into<Ipv4Addr>>(&mut self, yiaddr: I) -> &mut Self {
        self.yiaddr = yiaddr.into();
        self
    }
    pub fn siaddr(&self) -> Ipv4Addr {
        self.siaddr
    }
    pub fn set_siaddr<I: Into<Ipv4Addr>>(&mut self, siaddr: I) -> &mut Self {
        self.siaddr = siaddr.into();
        self
    }
    pub fn giaddr(&self) -> Ipv4Addr {
        self.giaddr
    }
    pub fn set_giaddr<I: Into<Ipv4Addr>>(&mut self, giaddr: I) -> &mut Self {
        self.giaddr = giaddr.into();
        self
    }
    pub fn chaddr(&self) -> &[u8] {
        &self.chaddr
    }
    pub fn sname(&self) -> &[u8] {
        &self.sname
    }
    pub fn fname(&self) -> &[u8] {
        &self.fname
    }
    /// zero ciaddr/yiaddr/siaddr (used when turning a reply into a NAK)
    pub fn clear_addrs(&mut self) -> &mut Self {
        self.ciaddr = Ipv4Addr::UNSPECIFIED;
        self.yiaddr = Ipv4Addr::UNSPECIFIED;
        self.siaddr = Ipv4Addr::UNSPECIFIED;
        self
    }
    pub fn clear_sname(&mut self) -> &mut Self {
        self.sname.clear();
        self
    }
    pub fn clear_fname(&mut self) -> &mut Self {
        self.fname.clear();
        self
    }
    pub fn opts(&self) -> &DhcpOptions {
        &self.opts
    }
    pub fn opts_mut(&mut self) -> &mut DhcpOptions {
        &mut self.opts
    }
    /// whether the wire form carried a duplicate option code
    pub fn had_duplicate_options(&self) -> bool {
        self.had_duplicate
    }

    /// Parse the raw vendor-specific information (option 43) into
    /// (code, value) suboptions. Returns `None` when the option is absent.
    /// Decode failure is left to the caller to log; the message itself
    /// stays valid.
    pub fn parse_vendor_suboptions(&self) -> Option<DecodeResult<Vec<(u8, Vec<u8>)>>> {
        let raw = match self.opts.get(OptionCode::VendorExtensions) {
            Some(DhcpOption::VendorExtensions(raw)) => raw,
            _ => return None,
        };
        let mut dec = Decoder::new(raw);
        let mut subs = Vec::new();
        let res = loop {
            match dec.peek_u8() {
                None | Some(255) => break Ok(subs),
                Some(0) => {
                    let _ = dec.read_u8();
                    continue;
                }
                Some(_) => {}
            }
            let code = match dec.read_u8() {
                Ok(c) => c,
                Err(e) => break Err(e),
            };
            let len = match dec.read_u8() {
                Ok(l) => l as usize,
                Err(e) => break Err(e),
            };
            match dec.read_slice(len) {
                Ok(data) => subs.push((code, data.to_vec())),
                Err(e) => break Err(e),
            }
        };
        Some(res)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "op: {:?} xid: {:#x} ciaddr: {} yiaddr: {} giaddr: {} chaddr: {} msg_type: {:?}",
            self.opcode,
            self.xid,
            self.ciaddr,
            self.yiaddr,
            self.giaddr,
            hex::encode(&self.chaddr),
            self.opts.msg_type(),
        )
    }
}

impl Decodable for Message {
    fn decode(dec: &mut Decoder<'_>) -> DecodeResult<Self> {
        let opcode = Opcode::from(dec.read_u8()?);
        let htype = dec.read_u8()?;
        let hlen = dec.read_u8()? as usize;
        let hops = dec.read_u8()?;
        let xid = dec.read_u32()?;
        let secs = dec.read_u16()?;
        let flags = Flags::new(dec.read_u16()?);
        let ciaddr = dec.read_ipv4()?;
        let yiaddr = dec.read_ipv4()?;
        let siaddr = dec.read_ipv4()?;
        let giaddr = dec.read_ipv4()?;
        let chaddr_field = dec.read_slice(CHADDR_LEN)?;
        let chaddr = chaddr_field[..hlen.min(CHADDR_LEN)].to_vec();
        let sname = dec.read_cstr_field(SNAME_LEN)?;
        let fname = dec.read_cstr_field(FILE_LEN)?;

        let cookie = dec.read_u32()?;
        if cookie != MAGIC {
            return Err(DecodeError::BadMagic { cookie });
        }

        let mut opts = DhcpOptions::new();
        let mut had_duplicate = false;
        while let Some(code) = dec.peek_u8() {
            match code {
                // END
                255 => break,
                // PAD
                0 => {
                    let _ = dec.read_u8();
                    continue;
                }
                _ => {}
            }
            let code = dec.read_u8()?;
            let len = dec.read_u8()? as usize;
            if len > dec.remaining() {
                return Err(DecodeError::LengthOverflow {
                    code: code as u16,
                    len,
                    remaining: dec.remaining(),
                });
            }
            let data = dec.read_slice(len)?;
            // duplicate codes: keep the last occurrence but remember we
            // saw one, so policy stays observable upstream
            if opts.insert(DhcpOption::parse(code, data)?).is_some() {
                had_duplicate = true;
            }
        }

        Ok(Message {
            opcode,
            htype,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            fname,
            opts,
            had_duplicate,
        })
    }
}

impl Encodable for Message {
    fn encode(&self, enc: &mut Encoder<'_>) -> EncodeResult<()> {
        enc.write_u8(u8::from(self.opcode))?;
        enc.write_u8(self.htype)?;
        enc.write_u8(self.chaddr.len() as u8)?;
        enc.write_u8(self.hops)?;
        enc.write_u32(self.xid)?;
        enc.write_u16(self.secs)?;
        enc.write_u16(self.flags.bits())?;
        enc.write_ipv4(self.ciaddr)?;
        enc.write_ipv4(self.yiaddr)?;
        enc.write_ipv4(self.siaddr)?;
        enc.write_ipv4(self.giaddr)?;
        enc.write_fill_bytes(&self.chaddr, CHADDR_LEN)?;
        enc.write_fill_bytes(&self.sname, SNAME_LEN)?;
        enc.write_fill_bytes(&self.fname, FILE_LEN)?;
        enc.write_u32(MAGIC)?;
        for (code, opt) in self.opts.iter() {
            let body = opt.body()?;
            if body.len() > u8::MAX as usize {
                return Err(EncodeError::LengthOverflow {
                    code: u8::from(*code) as u16,
                    len: body.len(),
                });
            }
            enc.write_u8(u8::from(*code))?;
            enc.write_u8(body.len() as u8)?;
            enc.write_slice(&body)?;
        }
        enc.write_u8(255)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discover() -> Message {
        let uns = Ipv4Addr::UNSPECIFIED;
        let mut msg = Message::new_with_id(
            0x1234_5678,
            uns,
            uns,
            uns,
            uns,
            &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01],
        );
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Discover));
        msg.opts_mut().insert(DhcpOption::ParameterRequestList(vec![
            OptionCode::SubnetMask,
            OptionCode::Router,
            OptionCode::DomainNameServer,
        ]));
        msg
    }

    #[test]
    fn round_trip_discover() {
        let msg = discover();
        let bytes = msg.to_vec().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trip_offer_with_options() {
        let mut msg = discover();
        msg.set_opcode(Opcode::BootReply)
            .set_yiaddr([192, 0, 2, 100])
            .set_siaddr([192, 0, 2, 1]);
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Offer));
        msg.opts_mut()
            .insert(DhcpOption::AddressLeaseTime(4000));
        msg.opts_mut()
            .insert(DhcpOption::ServerIdentifier([192, 0, 2, 1].into()));
        msg.opts_mut()
            .insert(DhcpOption::Router(vec![[192, 0, 2, 1].into()]));
        msg.opts_mut()
            .insert(DhcpOption::SubnetMask([255, 255, 255, 0].into()));
        let decoded = Message::from_bytes(&msg.to_vec().unwrap()).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(decoded.opts().msg_type(), Some(MessageType::Offer));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let msg = discover();
        let mut bytes = msg.to_vec().unwrap();
        // cookie starts right after the fixed 236-byte header
        bytes[236] = 0;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(DecodeError::BadMagic { .. })
        ));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let msg = discover();
        let bytes = msg.to_vec().unwrap();
        assert!(matches!(
            Message::from_bytes(&bytes[..100]),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn option_length_overflow() {
        let msg = discover();
        let mut bytes = msg.to_vec().unwrap();
        // first option TLV follows the cookie: corrupt its length byte
        bytes[241] = 200;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(DecodeError::LengthOverflow { .. })
        ));
    }

    #[test]
    fn duplicate_option_last_wins_and_flags() {
        let msg = discover();
        let mut bytes = msg.to_vec().unwrap();
        // strip END, append a second message-type option then END
        assert_eq!(bytes.pop(), Some(255));
        bytes.extend_from_slice(&[53, 1, 3, 255]);
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert!(decoded.had_duplicate_options());
        assert_eq!(decoded.opts().msg_type(), Some(MessageType::Request));
    }

    #[test]
    fn pad_options_are_skipped() {
        let msg = discover();
        let mut bytes = msg.to_vec().unwrap();
        assert_eq!(bytes.pop(), Some(255));
        bytes.extend_from_slice(&[0, 0, 0, 255]);
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.opts().len(), msg.opts().len());
    }

    #[test]
    fn vendor_suboptions_deferred_parse() {
        let mut msg = discover();
        msg.opts_mut().insert(DhcpOption::VendorExtensions(vec![
            1, 2, 0xde, 0xad, // sub 1, len 2
            7, 1, 0x2a, // sub 7, len 1
        ]));
        let subs = msg.parse_vendor_suboptions().unwrap().unwrap();
        assert_eq!(
            subs,
            vec![(1, vec![0xde, 0xad]), (7, vec![0x2a])]
        );

        // garbage stays raw and reports the failure without invalidating
        // the message
        msg.opts_mut()
            .insert(DhcpOption::VendorExtensions(vec![1, 200, 1]));
        assert!(msg.parse_vendor_suboptions().unwrap().is_err());
    }

    #[test]
    fn oversize_option_value_fails_encode() {
        let mut msg = discover();
        msg.opts_mut()
            .insert(DhcpOption::ClientIdentifier(vec![0u8; 300]));
        assert!(matches!(
            msg.to_vec(),
            Err(EncodeError::LengthOverflow { .. })
        ));
    }
}
