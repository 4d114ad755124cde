//! Server-side SMTP protocol surface: command recognition, envelope
//! address and parameter parsing, response framing, and the trusted
//! prelude grammars (PROXY v1, XCLIENT, XFORWARD).
//!
//! This crate is wire-format only; it performs no IO and holds no
//! session state.

mod address;
mod command;
mod forward;
mod proxy;
mod response;

pub use address::{parse_mail_from, parse_rcpt_to, xtext_decode, ParamValue, PathCommand};
pub use command::Command;
pub use forward::{parse_attributes, Attribute};
pub use proxy::{ProxyAddresses, ProxyHeader};
pub use response::{EnhancedStatusCode, Response};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("{0}")]
    Syntax(String),
    #[error("Error: Unknown parameter {0}")]
    UnknownParameter(String),
    #[error("malformed PROXY header: {0}")]
    BadProxyHeader(String),
}

impl ProtoError {
    /// The SMTP response code this error maps to when surfaced to a peer.
    pub fn response_code(&self) -> u16 {
        match self {
            Self::Syntax(_) | Self::UnknownParameter(_) => 501,
            Self::BadProxyHeader(_) => 500,
        }
    }
}
