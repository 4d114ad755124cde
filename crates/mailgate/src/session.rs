use rand::RngCore;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Parsed envelope path: address plus extension arguments, as handed
/// to the MAIL/RCPT handlers and kept on the envelope.
pub type MailPath = smtp_proto::PathCommand;

/// Which command opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    Helo,
    Ehlo,
    Lhlo,
}

/// BODY= parameter of MAIL FROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
}

/// RET= parameter of MAIL FROM (RFC 3461).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnRet {
    Full,
    Hdrs,
}

/// Negotiated TLS parameters, captured after a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub protocol: String,
    pub cipher: String,
}

/// The transaction envelope. Reset on HELO/EHLO/LHLO, RSET, DATA
/// completion and XCLIENT ADDR override.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub mail_from: Option<MailPath>,
    pub rcpt_to: Vec<MailPath>,
    pub body_type: Option<BodyType>,
    pub smtp_utf8: bool,
    pub require_tls: bool,
    pub dsn_ret: Option<DsnRet>,
    pub dsn_envid: Option<String>,
}

impl Envelope {
    /// Add a recipient, deduplicating by case-insensitive address.
    /// A duplicate replaces the earlier entry in place, keeping its
    /// original position in the delivery order.
    pub fn add_rcpt(&mut self, rcpt: MailPath) {
        match self
            .rcpt_to
            .iter()
            .position(|r| r.address.eq_ignore_ascii_case(&rcpt.address))
        {
            Some(i) => self.rcpt_to[i] = rcpt,
            None => self.rcpt_to.push(rcpt),
        }
    }
}

/// Per-connection session state, visible to every handler callback.
/// Outlives the transactions that run within the connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Short case-insensitive connection identifier.
    pub id: String,

    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,

    /// Reverse-DNS name of the peer, or `[ip]` when unresolved.
    pub client_hostname: String,

    pub opening_command: Option<Greeting>,

    /// The argument the client gave to HELO/EHLO/LHLO, lowercased.
    pub host_name_appears_as: Option<String>,

    /// True once the wire is TLS-protected. Never reverts.
    pub secure: bool,
    pub tls_info: Option<TlsInfo>,

    /// Authenticated identity, set by a successful AUTH.
    pub user: Option<String>,

    /// Bumped each time a DATA phase is accepted.
    pub transaction: u64,

    pub envelope: Envelope,

    pub xclient: BTreeMap<String, String>,
    pub xforward: BTreeMap<String, String>,

    /// Last error response sent on this connection, for logging.
    pub error: Option<String>,

    pub(crate) lmtp: bool,
    /// PROTO= override from XCLIENT, supplanting the observed greeting
    /// when deriving the transmission type.
    pub(crate) proto_override: Option<String>,
}

impl Session {
    pub(crate) fn new(
        local: (IpAddr, u16),
        remote: (IpAddr, u16),
        lmtp: bool,
    ) -> Self {
        let remote_address = canonical_ip(remote.0);
        Self {
            id: new_session_id(),
            local_address: canonical_ip(local.0),
            local_port: local.1,
            remote_address,
            remote_port: remote.1,
            client_hostname: format!("[{remote_address}]"),
            opening_command: None,
            host_name_appears_as: None,
            secure: false,
            tls_info: None,
            user: None,
            transaction: 1,
            envelope: Envelope::default(),
            xclient: BTreeMap::new(),
            xforward: BTreeMap::new(),
            error: None,
            lmtp,
            proto_override: None,
        }
    }

    /// Replace the remote endpoint (PROXY header or XCLIENT ADDR).
    pub(crate) fn override_remote(&mut self, addr: IpAddr, port: Option<u16>) {
        self.remote_address = canonical_ip(addr);
        if let Some(port) = port {
            self.remote_port = port;
        }
        self.client_hostname = format!("[{}]", self.remote_address);
    }

    /// Derived transmission type: base protocol, extended flag,
    /// `S` for secure, `A` for authenticated. e.g. `ESMTPSA`.
    pub fn transmission_type(&self) -> String {
        let mut out = String::with_capacity(8);
        let (base, extended) = match self.proto_override.as_deref() {
            Some("ESMTP") => ("SMTP", true),
            Some("SMTP") => ("SMTP", false),
            Some("LMTP") => ("LMTP", false),
            _ if self.lmtp => ("LMTP", false),
            _ => (
                "SMTP",
                matches!(self.opening_command, Some(Greeting::Ehlo | Greeting::Lhlo)),
            ),
        };
        if base == "SMTP" && extended {
            out.push('E');
        }
        out.push_str(base);
        if self.secure {
            out.push('S');
        }
        if self.user.is_some() {
            out.push('A');
        }
        out
    }

    pub(crate) fn reset_envelope(&mut self) {
        self.envelope = Envelope::default();
    }
}

/// Strip any `::ffff:` IPv4-mapped prefix so sessions always see the
/// plain IPv4 form.
pub(crate) fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut bytes);
    data_encoding::BASE32_NOPAD
        .encode(&bytes)
        .to_ascii_lowercase()
}
