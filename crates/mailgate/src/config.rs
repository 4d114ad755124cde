use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// SASL mechanisms the listener can offer.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum Mechanism {
    Plain,
    Login,
    #[serde(rename = "XOAUTH2")]
    XOAuth2,
    CramMd5,
    /// Not negotiable on the wire; identity asserted via XCLIENT LOGIN.
    #[serde(skip)]
    XClient,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::XOAuth2 => "XOAUTH2",
            Self::CramMd5 => "CRAM-MD5",
            Self::XClient => "XCLIENT",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "XOAUTH2" => Some(Self::XOAuth2),
            "CRAM-MD5" => Some(Self::CramMd5),
            _ => None,
        }
    }
}

/// Where PEM material comes from: a file on disk or inline text.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum KeySource {
    File { path: PathBuf },
    Inline { pem: String },
}

impl KeySource {
    pub async fn get(&self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::File { path } => tokio::fs::read(path).await,
            Self::Inline { pem } => Ok(pem.clone().into_bytes()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TlsKeyPair {
    pub certificate: KeySource,
    pub private_key: KeySource,
}

/// TLS material for the listener. With no certificate configured, a
/// self-signed certificate for `name` is generated at startup.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub certificate: Option<KeySource>,
    pub private_key: Option<KeySource>,
    /// Additional certificates keyed by SNI servername.
    #[serde(default)]
    pub sni: HashMap<String, TlsKeyPair>,
}

/// Which remote peers are expected to send a PROXY v1 prelude.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProxyTrust {
    Toggle(bool),
    Hosts(Vec<IpAddr>),
}

impl Default for ProxyTrust {
    fn default() -> Self {
        Self::Toggle(false)
    }
}

impl ProxyTrust {
    pub fn applies_to(&self, remote: IpAddr) -> bool {
        match self {
            Self::Toggle(enabled) => *enabled,
            Self::Hosts(hosts) => hosts.contains(&remote),
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Self::Toggle(enabled) => *enabled,
            Self::Hosts(hosts) => !hosts.is_empty(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerOptions {
    /// Hostname used in the banner and EHLO response. Defaults to the
    /// machine hostname.
    pub name: Option<String>,

    /// Extra text appended to the 220 greeting.
    pub banner: Option<String>,

    /// Speak LMTP instead of SMTP: LHLO opens the session and DATA is
    /// answered once per recipient.
    pub lmtp: bool,

    /// Wrap sockets in TLS immediately on accept.
    pub secure: bool,

    /// Accept plaintext, then upgrade to TLS before greeting. For
    /// listeners behind a terminating proxy that hands over the
    /// handshake.
    pub needs_upgrade: bool,

    pub tls: Option<TlsSettings>,

    /// Maximum message size in bytes; advertised via SIZE and enforced
    /// after DATA.
    pub size: Option<u64>,

    /// Advertise SIZE without the limit value and skip the MAIL
    /// `SIZE=` pre-check.
    pub hide_size: bool,

    pub auth_methods: Vec<Mechanism>,

    /// Allow MAIL/RCPT/DATA without authentication even when auth
    /// methods are configured.
    pub auth_optional: bool,

    /// Permit AUTH on connections not protected by TLS.
    pub allow_insecure_auth: bool,

    /// Verbs to treat as if the server never knew them.
    pub disabled_commands: Vec<String>,

    pub hide_starttls: bool,
    pub hide_pipelining: bool,
    #[serde(rename = "hide_8bitmime")]
    pub hide_eightbitmime: bool,
    pub hide_smtputf8: bool,

    /// Advertise the DSN extension. Parameter validation for
    /// NOTIFY/ORCPT/RET/ENVID happens regardless.
    pub enable_dsn: bool,
    pub hide_dsn: bool,

    pub enable_enhanced_status_codes: bool,
    pub hide_enhanced_status_codes: bool,

    /// Offer REQUIRETLS (RFC 8689). Off unless explicitly enabled.
    pub enable_requiretls: bool,
    pub hide_requiretls: bool,

    pub max_clients: Option<usize>,

    /// Cap on RCPT TO commands per transaction. `None` is unlimited.
    pub max_recipients: Option<usize>,

    #[serde(
        default = "ServerOptions::default_socket_timeout",
        with = "duration_serde"
    )]
    pub socket_timeout: Duration,

    #[serde(
        default = "ServerOptions::default_close_timeout",
        with = "duration_serde"
    )]
    pub close_timeout: Duration,

    #[serde(
        default = "ServerOptions::default_lookup_timeout",
        with = "duration_serde"
    )]
    pub lookup_timeout: Duration,

    pub use_proxy: ProxyTrust,
    pub use_xclient: bool,
    pub use_xforward: bool,

    pub disable_reverse_lookup: bool,

    /// Remote addresses whose connections are dropped without a
    /// greeting or any handler involvement.
    pub ignored_hosts: Vec<IpAddr>,

    #[serde(default = "ServerOptions::default_abuse_limit")]
    pub max_unauthenticated_commands: usize,

    #[serde(default = "ServerOptions::default_abuse_limit")]
    pub max_unrecognized_commands: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: None,
            banner: None,
            lmtp: false,
            secure: false,
            needs_upgrade: false,
            tls: None,
            size: None,
            hide_size: false,
            auth_methods: vec![Mechanism::Plain, Mechanism::Login],
            auth_optional: false,
            allow_insecure_auth: false,
            disabled_commands: vec![],
            hide_starttls: false,
            hide_pipelining: false,
            hide_eightbitmime: false,
            hide_smtputf8: false,
            enable_dsn: false,
            hide_dsn: false,
            enable_enhanced_status_codes: false,
            hide_enhanced_status_codes: false,
            enable_requiretls: false,
            hide_requiretls: false,
            max_clients: None,
            max_recipients: None,
            socket_timeout: Self::default_socket_timeout(),
            close_timeout: Self::default_close_timeout(),
            lookup_timeout: Self::default_lookup_timeout(),
            use_proxy: ProxyTrust::default(),
            use_xclient: false,
            use_xforward: false,
            disable_reverse_lookup: false,
            ignored_hosts: vec![],
            max_unauthenticated_commands: Self::default_abuse_limit(),
            max_unrecognized_commands: Self::default_abuse_limit(),
        }
    }
}

impl ServerOptions {
    fn default_socket_timeout() -> Duration {
        Duration::from_secs(60)
    }

    fn default_close_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn default_lookup_timeout() -> Duration {
        Duration::from_millis(1500)
    }

    fn default_abuse_limit() -> usize {
        10
    }

    pub fn server_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => gethostname::gethostname()
                .to_str()
                .unwrap_or("localhost")
                .to_string(),
        }
    }

    pub fn command_disabled(&self, verb: &str) -> bool {
        self.disabled_commands
            .iter()
            .any(|c| c.eq_ignore_ascii_case(verb))
    }
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(de)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(serde::de::Error::custom("invalid duration"));
        }
        Ok(Duration::from_secs_f64(seconds))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let options = ServerOptions::default();
        assert_eq!(options.socket_timeout, Duration::from_secs(60));
        assert_eq!(options.close_timeout, Duration::from_secs(30));
        assert_eq!(options.max_unrecognized_commands, 10);
        assert_eq!(
            options.auth_methods,
            vec![Mechanism::Plain, Mechanism::Login]
        );
    }

    #[test]
    fn disabled_commands_match_case_insensitively() {
        let options = ServerOptions {
            disabled_commands: vec!["starttls".to_string()],
            ..Default::default()
        };
        assert!(options.command_disabled("STARTTLS"));
        assert!(!options.command_disabled("AUTH"));
    }

    #[test]
    fn proxy_trust_modes() {
        let all = ProxyTrust::Toggle(true);
        assert!(all.applies_to("10.0.0.1".parse().unwrap()));

        let some = ProxyTrust::Hosts(vec!["10.0.0.1".parse().unwrap()]);
        assert!(some.applies_to("10.0.0.1".parse().unwrap()));
        assert!(!some.applies_to("10.0.0.2".parse().unwrap()));
        assert!(some.enabled());
        assert!(!ProxyTrust::default().enabled());
    }
}
