//! SOCKS5 wire format, the RFC 1928 subset the proxy speaks.
//!
//! The request address block (`atyp | addr | port`) doubles as the
//! destination header sent as the first plaintext of a relayed session,
//! so `Address` keeps its encoding byte-exact with what the client sent.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::{ProxyError, Result};

pub const SVERSION: u8 = 0x05;

pub const METHOD_NOAUTH: u8 = 0x00;
pub const METHOD_UNACCEPTABLE: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_CONN_DISALLOWED: u8 = 0x02;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRTYPE_NOT_SUPPORTED: u8 = 0x08;

/// A destination: either an IP literal or a name the relay (or the
/// local resolver) will look up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

/// Outcome of decoding an address block from a partially-read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum AddrDecode {
    Parsed { addr: Address, consumed: usize },
    Incomplete,
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(sa) => sa.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn is_ip(&self) -> bool {
        matches!(self, Address::Ip(_))
    }

    /// The value fed to the ACL: the literal IP as text, or the name.
    pub fn host_str(&self) -> String {
        match self {
            Address::Ip(sa) => sa.ip().to_string(),
            Address::Domain(name, _) => name.clone(),
        }
    }

    /// Decode `atyp | addr | port` from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<AddrDecode> {
        if buf.is_empty() {
            return Ok(AddrDecode::Incomplete);
        }
        match buf[0] {
            ATYP_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Ok(AddrDecode::Incomplete);
                }
                let ip: [u8; 4] = buf[1..5].try_into().expect("length checked");
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(AddrDecode::Parsed {
                    addr: Address::Ip(SocketAddr::new(IpAddr::from(ip), port)),
                    consumed: 7,
                })
            }
            ATYP_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Ok(AddrDecode::Incomplete);
                }
                let ip: [u8; 16] = buf[1..17].try_into().expect("length checked");
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok(AddrDecode::Parsed {
                    addr: Address::Ip(SocketAddr::new(IpAddr::from(ip), port)),
                    consumed: 19,
                })
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    return Ok(AddrDecode::Incomplete);
                }
                let name_len = buf[1] as usize;
                if buf.len() < 2 + name_len + 2 {
                    return Ok(AddrDecode::Incomplete);
                }
                let name = std::str::from_utf8(&buf[2..2 + name_len])
                    .map_err(|_| {
                        ProxyError::ClientProtocol("destination name is not utf-8".into())
                    })?
                    .to_owned();
                let port = u16::from_be_bytes([buf[2 + name_len], buf[3 + name_len]]);
                Ok(AddrDecode::Parsed {
                    addr: Address::Domain(name, port),
                    consumed: 2 + name_len + 2,
                })
            }
            other => Err(ProxyError::ClientProtocol(format!(
                "unsupported address type: {other}"
            ))),
        }
    }

    /// Encode as `atyp | addr | port`, the exact block a relay expects
    /// at the head of the first payload.
    pub fn write_socks5(&self, out: &mut Vec<u8>) {
        match self {
            Address::Ip(SocketAddr::V4(sa)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&sa.ip().octets());
                out.extend_from_slice(&sa.port().to_be_bytes());
            }
            Address::Ip(SocketAddr::V6(sa)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&sa.ip().octets());
                out.extend_from_slice(&sa.port().to_be_bytes());
            }
            Address::Domain(name, port) => {
                out.push(ATYP_DOMAIN);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    pub fn to_socks5_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(19);
        self.write_socks5(&mut out);
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(sa) => write!(f, "{sa}"),
            Address::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

/// `ver | rep | rsv | atyp | bnd.addr | bnd.port`. Without a real bound
/// address the reply is padded with an all-zero IPv4 block, which every
/// client treats as "ignore".
pub fn encode_reply(rep: u8, bind: Option<SocketAddr>) -> Vec<u8> {
    let mut out = vec![SVERSION, rep, 0x00];
    match bind {
        Some(sa) => Address::Ip(sa).write_socks5(&mut out),
        None => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ipv4() {
        let buf = [ATYP_IPV4, 10, 1, 2, 3, 0x00, 0x50, 0xde, 0xad];
        match Address::decode(&buf).unwrap() {
            AddrDecode::Parsed { addr, consumed } => {
                assert_eq!(addr, Address::Ip("10.1.2.3:80".parse().unwrap()));
                assert_eq!(consumed, 7);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_domain_roundtrip() {
        let addr = Address::Domain("example.com".into(), 443);
        let bytes = addr.to_socks5_bytes();
        assert_eq!(bytes[0], ATYP_DOMAIN);
        assert_eq!(bytes[1], 11);
        match Address::decode(&bytes).unwrap() {
            AddrDecode::Parsed { addr: parsed, consumed } => {
                assert_eq!(parsed, addr);
                assert_eq!(consumed, bytes.len());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_ipv6_roundtrip() {
        let addr = Address::Ip("[2001:db8::1]:8443".parse().unwrap());
        let bytes = addr.to_socks5_bytes();
        assert_eq!(bytes.len(), 19);
        match Address::decode(&bytes).unwrap() {
            AddrDecode::Parsed { addr: parsed, .. } => assert_eq!(parsed, addr),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn truncated_blocks_are_incomplete() {
        assert_eq!(Address::decode(&[]).unwrap(), AddrDecode::Incomplete);
        assert_eq!(
            Address::decode(&[ATYP_IPV4, 10, 1]).unwrap(),
            AddrDecode::Incomplete
        );
        assert_eq!(
            Address::decode(&[ATYP_DOMAIN, 5, b'a', b'b']).unwrap(),
            AddrDecode::Incomplete
        );
    }

    #[test]
    fn bad_atyp_is_protocol_error() {
        assert!(matches!(
            Address::decode(&[0x02, 0, 0]),
            Err(ProxyError::ClientProtocol(_))
        ));
    }

    #[test]
    fn padded_reply_bytes() {
        assert_eq!(
            encode_reply(REP_SUCCEEDED, None),
            vec![5, 0, 0, 1, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn reply_with_bound_addr() {
        let reply = encode_reply(REP_SUCCEEDED, Some("127.0.0.1:1080".parse().unwrap()));
        assert_eq!(reply, vec![5, 0, 0, 1, 127, 0, 0, 1, 0x04, 0x38]);
    }
}
