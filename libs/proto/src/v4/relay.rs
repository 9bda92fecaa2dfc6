//! Relay agent information (option 82) suboptions (RFC 3046 / RFC 3527)
use std::{collections::BTreeMap, net::Ipv4Addr};

use crate::{
    Decodable, Decoder, Encodable, Encoder,
    error::{DecodeError, DecodeResult, EncodeResult},
};

/// relay suboption codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelayCode {
    AgentCircuitId,
    AgentRemoteId,
    LinkSelection,
    Unknown(u8),
}

impl From<u8> for RelayCode {
    fn from(n: u8) -> Self {
        match n {
            1 => RelayCode::AgentCircuitId,
            2 => RelayCode::AgentRemoteId,
            5 => RelayCode::LinkSelection,
            n => RelayCode::Unknown(n),
        }
    }
}

impl From<RelayCode> for u8 {
    fn from(code: RelayCode) -> Self {
        match code {
            RelayCode::AgentCircuitId => 1,
            RelayCode::AgentRemoteId => 2,
            RelayCode::LinkSelection => 5,
            RelayCode::Unknown(n) => n,
        }
    }
}

/// a decoded relay suboption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayInfo {
    AgentCircuitId(Vec<u8>),
    AgentRemoteId(Vec<u8>),
    /// link selection (RFC 3527). Takes priority over option 118 when both
    /// are present.
    LinkSelection(Ipv4Addr),
    Unknown { code: u8, data: Vec<u8> },
}

impl From<&RelayInfo> for RelayCode {
    fn from(info: &RelayInfo) -> Self {
        match info {
            RelayInfo::AgentCircuitId(_) => RelayCode::AgentCircuitId,
            RelayInfo::AgentRemoteId(_) => RelayCode::AgentRemoteId,
            RelayInfo::LinkSelection(_) => RelayCode::LinkSelection,
            RelayInfo::Unknown { code, .. } => RelayCode::Unknown(*code),
        }
    }
}

/// option 82 payload: a set of suboptions keyed by code
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayAgentInformation(BTreeMap<RelayCode, RelayInfo>);

impl RelayAgentInformation {
    pub fn get(&self, code: RelayCode) -> Option<&RelayInfo> {
        self.0.get(&code)
    }
    pub fn insert(&mut self, info: RelayInfo) -> Option<RelayInfo> {
        self.0.insert(RelayCode::from(&info), info)
    }
    pub fn iter(&self) -> impl Iterator<Item = (&RelayCode, &RelayInfo)> {
        self.0.iter()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Decodable for RelayAgentInformation {
    fn decode(dec: &mut Decoder<'_>) -> DecodeResult<Self> {
        let mut subs = BTreeMap::new();
        while !dec.is_empty() {
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
            let info = match RelayCode::from(code) {
                RelayCode::AgentCircuitId => RelayInfo::AgentCircuitId(data.to_vec()),
                RelayCode::AgentRemoteId => RelayInfo::AgentRemoteId(data.to_vec()),
                RelayCode::LinkSelection => {
                    let mut d = Decoder::new(data);
                    RelayInfo::LinkSelection(d.read_ipv4()?)
                }
                RelayCode::Unknown(code) => RelayInfo::Unknown {
                    code,
                    data: data.to_vec(),
                },
            };
            subs.insert(RelayCode::from(&info), info);
        }
        Ok(RelayAgentInformation(subs))
    }
}

impl Encodable for RelayAgentInformation {
    fn encode(&self, enc: &mut Encoder<'_>) -> EncodeResult<()> {
        for (code, info) in self.iter() {
            let body = match info {
                RelayInfo::AgentCircuitId(data) | RelayInfo::AgentRemoteId(data) => data.clone(),
                RelayInfo::LinkSelection(ip) => ip.octets().to_vec(),
                RelayInfo::Unknown { data, .. } => data.clone(),
            };
            enc.write_u8(u8::from(*code))?;
            enc.write_u8(body.len() as u8)?;
            enc.write_slice(&body)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut info = RelayAgentInformation::default();
        info.insert(RelayInfo::AgentCircuitId(b"eth0/1".to_vec()));
        info.insert(RelayInfo::LinkSelection([10, 1, 2, 0].into()));
        let bytes = info.to_vec().unwrap();
        assert_eq!(RelayAgentInformation::from_bytes(&bytes).unwrap(), info);
    }

    #[test]
    fn link_selection_lookup() {
        let mut info = RelayAgentInformation::default();
        info.insert(RelayInfo::LinkSelection([10, 1, 2, 0].into()));
        assert!(matches!(
            info.get(RelayCode::LinkSelection),
            Some(RelayInfo::LinkSelection(ip)) if *ip == Ipv4Addr::new(10, 1, 2, 0)
        ));
    }
}
