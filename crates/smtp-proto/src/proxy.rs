use crate::ProtoError;
use std::net::IpAddr;

/// A parsed HAProxy PROXY protocol v1 line.
///
/// `PROXY UNKNOWN` is represented with `addresses: None`: the header
/// was consumed but carries nothing to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub addresses: Option<ProxyAddresses>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddresses {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
}

impl ProxyHeader {
    /// Parse a PROXY v1 line (without its terminating newline).
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = line.split_ascii_whitespace();

        match fields.next() {
            Some(tag) if tag.eq_ignore_ascii_case("PROXY") => {}
            _ => {
                return Err(ProtoError::BadProxyHeader(format!(
                    "expected PROXY, got {line:?}"
                )))
            }
        }

        let protocol = fields
            .next()
            .ok_or_else(|| ProtoError::BadProxyHeader("missing protocol".to_string()))?;
        if protocol.eq_ignore_ascii_case("UNKNOWN") {
            return Ok(Self { addresses: None });
        }
        if !protocol.eq_ignore_ascii_case("TCP4") && !protocol.eq_ignore_ascii_case("TCP6") {
            return Err(ProtoError::BadProxyHeader(format!(
                "unsupported protocol {protocol}"
            )));
        }

        let mut next = |what: &str| {
            fields
                .next()
                .ok_or_else(|| ProtoError::BadProxyHeader(format!("missing {what}")))
        };

        let source: IpAddr = next("source address")?
            .parse()
            .map_err(|err| ProtoError::BadProxyHeader(format!("source address: {err}")))?;
        let destination: IpAddr = next("destination address")?
            .parse()
            .map_err(|err| ProtoError::BadProxyHeader(format!("destination address: {err}")))?;
        let source_port: u16 = next("source port")?
            .parse()
            .map_err(|err| ProtoError::BadProxyHeader(format!("source port: {err}")))?;
        let destination_port: u16 = next("destination port")?
            .parse()
            .map_err(|err| ProtoError::BadProxyHeader(format!("destination port: {err}")))?;

        Ok(Self {
            addresses: Some(ProxyAddresses {
                source,
                destination,
                source_port,
                destination_port,
            }),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tcp4() {
        let header =
            ProxyHeader::parse("PROXY TCP4 198.51.100.22 203.0.113.7 35646 80\r\n").unwrap();
        let addrs = header.addresses.unwrap();
        assert_eq!(addrs.source, "198.51.100.22".parse::<IpAddr>().unwrap());
        assert_eq!(addrs.source_port, 35646);
        assert_eq!(addrs.destination_port, 80);
    }

    #[test]
    fn tcp6() {
        let header =
            ProxyHeader::parse("PROXY TCP6 2001:db8::1 2001:db8::2 4242 25").unwrap();
        assert!(header.addresses.unwrap().source.is_ipv6());
    }

    #[test]
    fn unknown_protocol_consumes_header() {
        let header = ProxyHeader::parse("PROXY UNKNOWN").unwrap();
        assert_eq!(header.addresses, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ProxyHeader::parse("EHLO mx.example.com").is_err());
        assert!(ProxyHeader::parse("PROXY TCP4 not-an-ip ::2 1 2").is_err());
        assert!(ProxyHeader::parse("PROXY TCP4 1.2.3.4 5.6.7.8 99999 80").is_err());
    }
}
