//! DHCPv6 message and options (RFC 8415), relay encapsulation, and the
//! DHCPv4-over-DHCPv6 envelope (RFC 7341)
use std::{fmt, net::Ipv6Addr};

use crate::{
    Decodable, Decoder, Encodable, Encoder,
    error::{DecodeError, DecodeResult, EncodeError, EncodeResult},
    v4,
};

/// default DHCPv6 server port
pub const SERVER_PORT: u16 = 547;
/// default DHCPv6 client port
pub const CLIENT_PORT: u16 = 546;

/// DHCPv6 message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Solicit,
    Advertise,
    Request,
    Confirm,
    Renew,
    Rebind,
    Reply,
    Release,
    Decline,
    Reconfigure,
    InformationRequest,
    RelayForw,
    RelayRepl,
    /// DHCPv4-over-DHCPv6 query (RFC 7341)
    DhcpV4Query,
    /// DHCPv4-over-DHCPv6 response (RFC 7341)
    DhcpV4Response,
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(n: u8) -> Self {
        use MessageType::*;
        match n {
            1 => Solicit,
            2 => Advertise,
            3 => Request,
            4 => Confirm,
            5 => Renew,
            6 => Rebind,
            7 => Reply,
            8 => Release,
            9 => Decline,
            10 => Reconfigure,
            11 => InformationRequest,
            12 => RelayForw,
            13 => RelayRepl,
            20 => DhcpV4Query,
            21 => DhcpV4Response,
            n => Unknown(n),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(m: MessageType) -> Self {
        use MessageType::*;
        match m {
            Solicit => 1,
            Advertise => 2,
            Request => 3,
            Confirm => 4,
            Renew => 5,
            Rebind => 6,
            Reply => 7,
            Release => 8,
            Decline => 9,
            Reconfigure => 10,
            InformationRequest => 11,
            RelayForw => 12,
            RelayRepl => 13,
            DhcpV4Query => 20,
            DhcpV4Response => 21,
            Unknown(n) => n,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// DHCPv6 option codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionCode {
    ClientId,
    ServerId,
    IANA,
    IATA,
    IAAddr,
    ORO,
    Preference,
    ElapsedTime,
    RelayMsg,
    StatusCode,
    RapidCommit,
    InterfaceId,
    IAPD,
    IAPrefix,
    RemoteId,
    /// DHCPv4 message carried inside a v6 envelope (RFC 7341)
    Dhcpv4Msg,
    Unknown(u16),
}

impl From<u16> for OptionCode {
    fn from(n: u16) -> Self {
        use OptionCode::*;
        match n {
            1 => ClientId,
            2 => ServerId,
            3 => IANA,
            4 => IATA,
            5 => IAAddr,
            6 => ORO,
            7 => Preference,
            8 => ElapsedTime,
            9 => RelayMsg,
            13 => StatusCode,
            14 => RapidCommit,
            18 => InterfaceId,
            25 => IAPD,
            26 => IAPrefix,
            37 => RemoteId,
            87 => Dhcpv4Msg,
            n => Unknown(n),
        }
    }
}

impl From<OptionCode> for u16 {
    fn from(code: OptionCode) -> Self {
        use OptionCode::*;
        match code {
            ClientId => 1,
            ServerId => 2,
            IANA => 3,
            IATA => 4,
            IAAddr => 5,
            ORO => 6,
            Preference => 7,
            ElapsedTime => 8,
            RelayMsg => 9,
            StatusCode => 13,
            RapidCommit => 14,
            InterfaceId => 18,
            IAPD => 25,
            IAPrefix => 26,
            RemoteId => 37,
            Dhcpv4Msg => 87,
            Unknown(n) => n,
        }
    }
}

/// status codes carried in option 13
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    UnspecFail,
    NoAddrsAvail,
    NoBinding,
    NotOnLink,
    UseMulticast,
    NoPrefixAvail,
    Unknown(u16),
}

impl From<u16> for Status {
    fn from(n: u16) -> Self {
        use Status::*;
        match n {
            0 => Success,
            1 => UnspecFail,
            2 => NoAddrsAvail,
            3 => NoBinding,
            4 => NotOnLink,
            5 => UseMulticast,
            6 => NoPrefixAvail,
            n => Unknown(n),
        }
    }
}

impl From<Status> for u16 {
    fn from(s: Status) -> Self {
        use Status::*;
        match s {
            Success => 0,
            UnspecFail => 1,
            NoAddrsAvail => 2,
            NoBinding => 3,
            NotOnLink => 4,
            UseMulticast => 5,
            NoPrefixAvail => 6,
            Unknown(n) => n,
        }
    }
}

/// identity association for non-temporary addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IANA {
    pub id: u32,
    pub t1: u32,
    pub t2: u32,
    pub opts: DhcpOptions,
}

/// identity association for temporary addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IATA {
    pub id: u32,
    pub opts: DhcpOptions,
}

/// an address inside an IA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAAddr {
    pub addr: Ipv6Addr,
    pub preferred_life: u32,
    pub valid_life: u32,
    pub opts: DhcpOptions,
}

/// identity association for prefix delegation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAPD {
    pub id: u32,
    pub t1: u32,
    pub t2: u32,
    pub opts: DhcpOptions,
}

/// a delegated prefix inside an IA_PD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAPrefix {
    pub preferred_life: u32,
    pub valid_life: u32,
    pub prefix_len: u8,
    pub prefix: Ipv6Addr,
    pub opts: DhcpOptions,
}

/// option request option
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ORO {
    pub opts: Vec<OptionCode>,
}

/// a decoded DHCPv6 option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    ClientId(Vec<u8>),
    ServerId(Vec<u8>),
    IANA(IANA),
    IATA(IATA),
    IAAddr(IAAddr),
    ORO(ORO),
    Preference(u8),
    ElapsedTime(u16),
    /// the wrapped message of a relay-forward/relay-reply (option 9)
    RelayMsg(Box<Message>),
    StatusCode { status: Status, msg: String },
    RapidCommit,
    InterfaceId(Vec<u8>),
    IAPD(IAPD),
    IAPrefix(IAPrefix),
    RemoteId { enterprise_id: u32, data: Vec<u8> },
    /// raw DHCPv4 message bytes (option 87). Use
    /// [`Message::dhcpv4_msg`] for the decoded view.
    Dhcpv4Msg(Vec<u8>),
    Unknown { code: u16, data: Vec<u8> },
}

impl From<&DhcpOption> for OptionCode {
    fn from(opt: &DhcpOption) -> Self {
        use DhcpOption as O;
        match opt {
            O::ClientId(_) => OptionCode::ClientId,
            O::ServerId(_) => OptionCode::ServerId,
            O::IANA(_) => OptionCode::IANA,
            O::IATA(_) => OptionCode::IATA,
            O::IAAddr(_) => OptionCode::IAAddr,
            O::ORO(_) => OptionCode::ORO,
            O::Preference(_) => OptionCode::Preference,
            O::ElapsedTime(_) => OptionCode::ElapsedTime,
            O::RelayMsg(_) => OptionCode::RelayMsg,
            O::StatusCode { .. } => OptionCode::StatusCode,
            O::RapidCommit => OptionCode::RapidCommit,
            O::InterfaceId(_) => OptionCode::InterfaceId,
            O::IAPD(_) => OptionCode::IAPD,
            O::IAPrefix(_) => OptionCode::IAPrefix,
            O::RemoteId { .. } => OptionCode::RemoteId,
            O::Dhcpv4Msg(_) => OptionCode::Dhcpv4Msg,
            O::Unknown { code, .. } => OptionCode::Unknown(*code),
        }
    }
}

// option codes that may legitimately appear only once per scope. IA
// options can repeat (one per association) and are not duplicates.
fn is_singleton(code: OptionCode) -> bool {
    matches!(
        code,
        OptionCode::ClientId
            | OptionCode::ServerId
            | OptionCode::ORO
            | OptionCode::ElapsedTime
            | OptionCode::Preference
            | OptionCode::RapidCommit
            | OptionCode::StatusCode
    )
}

impl DhcpOption {
    fn parse(code: u16, data: &[u8]) -> DecodeResult<Self> {
        use DhcpOption as O;
        let mut dec = Decoder::new(data);
        Ok(match OptionCode::from(code) {
            OptionCode::ClientId => O::ClientId(data.to_vec()),
            OptionCode::ServerId => O::ServerId(data.to_vec()),
            OptionCode::IANA => O::IANA(IANA {
                id: dec.read_u32()?,
                t1: dec.read_u32()?,
                t2: dec.read_u32()?,
                opts: DhcpOptions::decode_all(&mut dec)?.0,
            }),
            OptionCode::IATA => O::IATA(IATA {
                id: dec.read_u32()?,
                opts: DhcpOptions::decode_all(&mut dec)?.0,
            }),
            OptionCode::IAAddr => O::IAAddr(IAAddr {
                addr: dec.read_ipv6()?,
                preferred_life: dec.read_u32()?,
                valid_life: dec.read_u32()?,
                opts: DhcpOptions::decode_all(&mut dec)?.0,
            }),
            OptionCode::ORO => {
                let mut opts = Vec::with_capacity(dec.remaining() / 2);
                while dec.remaining() >= 2 {
                    opts.push(OptionCode::from(dec.read_u16()?));
                }
                if !dec.is_empty() {
                    return Err(DecodeError::Truncated);
                }
                O::ORO(ORO { opts })
            }
            OptionCode::Preference => O::Preference(dec.read_u8()?),
            OptionCode::ElapsedTime => O::ElapsedTime(dec.read_u16()?),
            OptionCode::RelayMsg => O::RelayMsg(Box::new(Message::from_bytes(data)?)),
            OptionCode::StatusCode => {
                let status = Status::from(dec.read_u16()?);
                let msg = dec.read_slice(dec.remaining())?;
                O::StatusCode {
                    status,
                    msg: String::from_utf8(msg.to_vec())
                        .map_err(|_| DecodeError::InvalidField { field: "status msg" })?,
                }
            }
            OptionCode::RapidCommit => O::RapidCommit,
            OptionCode::InterfaceId => O::InterfaceId(data.to_vec()),
            OptionCode::IAPD => O::IAPD(IAPD {
                id: dec.read_u32()?,
                t1: dec.read_u32()?,
                t2: dec.read_u32()?,
                opts: DhcpOptions::decode_all(&mut dec)?.0,
            }),
            OptionCode::IAPrefix => O::IAPrefix(IAPrefix {
                preferred_life: dec.read_u32()?,
                valid_life: dec.read_u32()?,
                prefix_len: dec.read_u8()?,
                prefix: dec.read_ipv6()?,
                opts: DhcpOptions::decode_all(&mut dec)?.0,
            }),
            OptionCode::RemoteId => O::RemoteId {
                enterprise_id: dec.read_u32()?,
                data: dec.read_slice(dec.remaining())?.to_vec(),
            },
            OptionCode::Dhcpv4Msg => O::Dhcpv4Msg(data.to_vec()),
            OptionCode::Unknown(code) => O::Unknown {
                code,
                data: data.to_vec(),
            },
        })
    }

    fn body(&self) -> EncodeResult<Vec<u8>> {
        use DhcpOption as O;
        let mut out = Vec::new();
        let mut enc = Encoder::new(&mut out);
        match self {
            O::ClientId(data) | O::ServerId(data) | O::InterfaceId(data) | O::Dhcpv4Msg(data) => {
                enc.write_slice(data)?
            }
            O::IANA(ia) => {
                enc.write_u32(ia.id)?;
                enc.write_u32(ia.t1)?;
                enc.write_u32(ia.t2)?;
                ia.opts.encode(&mut enc)?;
            }
            O::IATA(ia) => {
                enc.write_u32(ia.id)?;
                ia.opts.encode(&mut enc)?;
            }
            O::IAAddr(ia) => {
                enc.write_ipv6(ia.addr)?;
                enc.write_u32(ia.preferred_life)?;
                enc.write_u32(ia.valid_life)?;
                ia.opts.encode(&mut enc)?;
            }
            O::ORO(oro) => {
                for code in &oro.opts {
                    enc.write_u16(u16::from(*code))?;
                }
            }
            O::Preference(n) => enc.write_u8(*n)?,
            O::ElapsedTime(n) => enc.write_u16(*n)?,
            O::RelayMsg(msg) => {
                msg.encode(&mut enc)?;
            }
            O::StatusCode { status, msg } => {
                enc.write_u16(u16::from(*status))?;
                enc.write_slice(msg.as_bytes())?;
            }
            O::RapidCommit => {}
            O::IAPD(ia) => {
                enc.write_u32(ia.id)?;
                enc.write_u32(ia.t1)?;
                enc.write_u32(ia.t2)?;
                ia.opts.encode(&mut enc)?;
            }
            O::IAPrefix(ia) => {
                enc.write_u32(ia.preferred_life)?;
                enc.write_u32(ia.valid_life)?;
                enc.write_u8(ia.prefix_len)?;
                enc.write_ipv6(ia.prefix)?;
                ia.opts.encode(&mut enc)?;
            }
            O::RemoteId {
                enterprise_id,
                data,
            } => {
                enc.write_u32(*enterprise_id)?;
                enc.write_slice(data)?;
            }
            O::Unknown { data, .. } => enc.write_slice(data)?,
        }
        Ok(out)
    }
}

/// DHCPv6 options in wire order. Unlike v4, an option code may repeat
/// (one IA option per association); [`DhcpOptions::get`] returns the
/// first occurrence, [`DhcpOptions::get_all`] every one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpOptions(Vec<DhcpOption>);

impl DhcpOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, code: OptionCode) -> Option<&DhcpOption> {
        self.0.iter().find(|o| OptionCode::from(*o) == code)
    }
    pub fn get_all(&self, code: OptionCode) -> impl Iterator<Item = &DhcpOption> {
        self.0.iter().filter(move |o| OptionCode::from(*o) == code)
    }
    pub fn insert(&mut self, opt: DhcpOption) {
        self.0.push(opt)
    }
    pub fn remove(&mut self, code: OptionCode) {
        self.0.retain(|o| OptionCode::from(o) != code)
    }
    pub fn iter(&self) -> impl Iterator<Item = &DhcpOption> {
        self.0.iter()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// decode options until the decoder is exhausted; second element of
    /// the pair reports whether a singleton option code repeated
    fn decode_all(dec: &mut Decoder<'_>) -> DecodeResult<(Self, bool)> {
        let mut opts = Vec::new();
        let mut had_duplicate = false;
        while !dec.is_empty() {
            let code = dec.read_u16()?;
            let len = dec.read_u16()? as usize;
            if len > dec.remaining() {
                return Err(DecodeError::LengthOverflow {
                    code,
                    len,
                    remaining: dec.remaining(),
                });
            }
            let data = dec.read_slice(len)?;
            let opt = DhcpOption::parse(code, data)?;
            let code = OptionCode::from(&opt);
            if is_singleton(code) && opts.iter().any(|o| OptionCode::from(o) == code) {
                // last occurrence wins
                had_duplicate = true;
                opts.retain(|o| OptionCode::from(o) != code);
            }
            opts.push(opt);
        }
        Ok((DhcpOptions(opts), had_duplicate))
    }
}

impl Encodable for DhcpOptions {
    fn encode(&self, enc: &mut Encoder<'_>) -> EncodeResult<()> {
        for opt in self.iter() {
            let body = opt.body()?;
            if body.len() > u16::MAX as usize {
                return Err(EncodeError::LengthOverflow {
                    code: u16::from(OptionCode::from(opt)),
                    len: body.len(),
                });
            }
            enc.write_u16(u16::from(OptionCode::from(opt)))?;
            enc.write_u16(body.len() as u16)?;
            enc.write_slice(&body)?;
        }
        Ok(())
    }
}

/// relay header fields present on relay-forward/relay-reply messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayHeader {
    pub hop_count: u8,
    pub link_addr: Ipv6Addr,
    pub peer_addr: Ipv6Addr,
}

/// A DHCPv6 message
///
/// Client/server messages carry msg-type(1) + xid(3); relay-forward and
/// relay-reply messages replace the xid with hop-count/link-address/
/// peer-address and wrap the inner message at option 9.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    msg_type: MessageType,
    xid: [u8; 3],
    relay: Option<RelayHeader>,
    opts: DhcpOptions,
    had_duplicate: bool,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Self::new_with_id(msg_type, [0, 0, 0])
    }

    pub fn new_with_id(msg_type: MessageType, xid: [u8; 3]) -> Self {
        Message {
            msg_type,
            xid,
            relay: None,
            opts: DhcpOptions::new(),
            had_duplicate: false,
        }
    }

    /// new relay-forward/relay-reply wrapper
    pub fn new_relay(msg_type: MessageType, header: RelayHeader) -> Self {
        Message {
            msg_type,
            xid: [0, 0, 0],
            relay: Some(header),
            opts: DhcpOptions::new(),
            had_duplicate: false,
        }
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }
    pub fn set_msg_type(&mut self, msg_type: MessageType) -> &mut Self {
        self.msg_type = msg_type;
        self
    }
    pub fn xid(&self) -> [u8; 3] {
        self.xid
    }
    /// xid widened for keying (parking lot, correlation)
    pub fn xid_num(&self) -> u32 {
        u32::from_be_bytes([0, self.xid[0], self.xid[1], self.xid[2]])
    }
    pub fn opts(&self) -> &DhcpOptions {
        &self.opts
    }
    pub fn opts_mut(&mut self) -> &mut DhcpOptions {
        &mut self.opts
    }
    pub fn is_relay(&self) -> bool {
        self.relay.is_some()
    }
    pub fn relay_header(&self) -> Option<RelayHeader> {
        self.relay
    }
    pub fn had_duplicate_options(&self) -> bool {
        self.had_duplicate
    }

    /// the wrapped message of a relay-forward/relay-reply, if present
    pub fn relay_msg(&self) -> Option<&Message> {
        match self.opts.get(OptionCode::RelayMsg) {
            Some(DhcpOption::RelayMsg(inner)) => Some(inner),
            _ => None,
        }
    }

    /// follow the relay chain to the innermost client message
    pub fn innermost(&self) -> &Message {
        let mut cur = self;
        while let Some(inner) = cur.relay_msg() {
            cur = inner;
        }
        cur
    }

    /// the v4 view of a DHCPv4-over-DHCPv6 envelope: decodes the message
    /// carried in option 87
    pub fn dhcpv4_msg(&self) -> Option<DecodeResult<v4::Message>> {
        match self.opts.get(OptionCode::Dhcpv4Msg) {
            Some(DhcpOption::Dhcpv4Msg(raw)) => Some(v4::Message::from_bytes(raw)),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "msg_type: {} xid: {:02x}{:02x}{:02x} opts: {}",
            self.msg_type,
            self.xid[0],
            self.xid[1],
            self.xid[2],
            self.opts.len()
        )
    }
}

impl Decodable for Message {
    fn decode(dec: &mut Decoder<'_>) -> DecodeResult<Self> {
        let raw_type = dec.read_u8()?;
        if raw_type == 0 {
            return Err(DecodeError::UnknownMandatory(raw_type));
        }
        let msg_type = MessageType::from(raw_type);
        let (xid, relay) = match msg_type {
            MessageType::RelayForw | MessageType::RelayRepl => {
                let hop_count = dec.read_u8()?;
                let link_addr = dec.read_ipv6()?;
                let peer_addr = dec.read_ipv6()?;
                (
                    [0, 0, 0],
                    Some(RelayHeader {
                        hop_count,
                        link_addr,
                        peer_addr,
                    }),
                )
            }
            _ => {
                let xid = dec.read_slice(3)?;
                ([xid[0], xid[1], xid[2]], None)
            }
        };
        let (opts, had_duplicate) = DhcpOptions::decode_all(dec)?;
        Ok(Message {
            msg_type,
            xid,
            relay,
            opts,
            had_duplicate,
        })
    }
}

impl Encodable for Message {
    fn encode(&self, enc: &mut Encoder<'_>) -> EncodeResult<()> {
        enc.write_u8(u8::from(self.msg_type))?;
        match self.relay {
            Some(header) => {
                enc.write_u8(header.hop_count)?;
                enc.write_ipv6(header.link_addr)?;
                enc.write_ipv6(header.peer_addr)?;
            }
            None => {
                enc.write_slice(&self.xid)?;
            }
        }
        self.opts.encode(enc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn solicit() -> Message {
        let mut msg = Message::new_with_id(MessageType::Solicit, [0xab, 0xcd, 0xef]);
        msg.opts_mut().insert(DhcpOption::ClientId(vec![0, 1, 0, 1, 1, 2, 3, 4]));
        msg.opts_mut().insert(DhcpOption::ElapsedTime(0));
        msg.opts_mut().insert(DhcpOption::IANA(IANA {
            id: 1,
            t1: 0,
            t2: 0,
            opts: DhcpOptions::new(),
        }));
        msg.opts_mut().insert(DhcpOption::ORO(ORO {
            opts: vec![OptionCode::Unknown(23), OptionCode::Unknown(24)],
        }));
        msg
    }

    #[test]
    fn round_trip_solicit() {
        let msg = solicit();
        let decoded = Message::from_bytes(&msg.to_vec().unwrap()).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(decoded.xid_num(), 0x00ab_cdef);
    }

    #[test]
    fn round_trip_reply_with_ia() {
        let mut reply = Message::new_with_id(MessageType::Reply, [1, 2, 3]);
        let mut ia_opts = DhcpOptions::new();
        ia_opts.insert(DhcpOption::IAAddr(IAAddr {
            addr: "2001:db8::100".parse().unwrap(),
            preferred_life: 3000,
            valid_life: 4000,
            opts: DhcpOptions::new(),
        }));
        reply.opts_mut().insert(DhcpOption::IANA(IANA {
            id: 1,
            t1: 2000,
            t2: 3200,
            opts: ia_opts,
        }));
        reply.opts_mut().insert(DhcpOption::StatusCode {
            status: Status::Success,
            msg: "assigned".into(),
        });
        let decoded = Message::from_bytes(&reply.to_vec().unwrap()).unwrap();
        assert_eq!(reply, decoded);
    }

    #[test]
    fn relay_forward_wraps_inner_message() {
        let inner = solicit();
        let mut relay = Message::new_relay(
            MessageType::RelayForw,
            RelayHeader {
                hop_count: 0,
                link_addr: "2001:db8:1::1".parse().unwrap(),
                peer_addr: "fe80::1".parse().unwrap(),
            },
        );
        relay
            .opts_mut()
            .insert(DhcpOption::InterfaceId(b"eth1".to_vec()));
        relay
            .opts_mut()
            .insert(DhcpOption::RelayMsg(Box::new(inner.clone())));

        let decoded = Message::from_bytes(&relay.to_vec().unwrap()).unwrap();
        assert_eq!(relay, decoded);
        assert!(decoded.is_relay());
        assert_eq!(decoded.innermost(), &inner);
    }

    #[test]
    fn dhcpv4_over_dhcpv6_exposes_both_views() {
        let uns = Ipv4Addr::UNSPECIFIED;
        let mut v4_msg = v4::Message::new(uns, uns, uns, uns, &[1, 2, 3, 4, 5, 6]);
        v4_msg
            .opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));

        let mut envelope = Message::new_with_id(MessageType::DhcpV4Query, [9, 9, 9]);
        envelope
            .opts_mut()
            .insert(DhcpOption::Dhcpv4Msg(v4_msg.to_vec().unwrap()));

        let decoded = Message::from_bytes(&envelope.to_vec().unwrap()).unwrap();
        assert_eq!(decoded.dhcpv4_msg().unwrap().unwrap(), v4_msg);
    }

    #[test]
    fn duplicate_singleton_last_wins_and_flags() {
        let msg = solicit();
        let mut bytes = msg.to_vec().unwrap();
        // append a second client id (code 1)
        bytes.extend_from_slice(&[0, 1, 0, 2, 0xaa, 0xbb]);
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert!(decoded.had_duplicate_options());
        assert_eq!(
            decoded.opts().get(OptionCode::ClientId),
            Some(&DhcpOption::ClientId(vec![0xaa, 0xbb]))
        );
    }

    #[test]
    fn reserved_message_type_is_mandatory_unknown() {
        assert!(matches!(
            Message::from_bytes(&[0, 1, 2, 3]),
            Err(DecodeError::UnknownMandatory(0))
        ));
    }

    #[test]
    fn truncated_option_is_rejected() {
        let msg = solicit();
        let mut bytes = msg.to_vec().unwrap();
        bytes.extend_from_slice(&[0, 14, 0, 4]); // rapid commit claiming 4 bytes
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(DecodeError::LengthOverflow { .. })
        ));
    }
}
