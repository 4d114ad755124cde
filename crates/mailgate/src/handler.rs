use crate::config::Mechanism;
use crate::session::Session;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use md5::Md5;
use smtp_stream::BodyStream;
use thiserror::Error;

/// A handler decision to refuse something, carrying the SMTP response
/// code and text that go on the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} {message}")]
pub struct RejectError {
    pub code: u16,
    pub message: String,
}

impl RejectError {
    pub fn new<S: Into<String>>(code: u16, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 550, the generic policy refusal.
    pub fn policy<S: Into<String>>(message: S) -> Self {
        Self::new(550, message)
    }
}

/// One AUTH attempt, as presented to [`SmtpHandler::on_auth`].
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub mechanism: Mechanism,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Bearer token from XOAUTH2.
    pub access_token: Option<String>,
    /// CRAM-MD5 challenge material; call
    /// [`CramMd5Validation::validate_password`] with the candidate
    /// password to verify the digest.
    pub cram: Option<CramMd5Validation>,
}

/// The CRAM-MD5 exchange: the challenge we issued and the hex digest
/// the client answered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CramMd5Validation {
    pub challenge: String,
    pub response_digest: String,
}

impl CramMd5Validation {
    /// Whether `password` produces the digest the client sent.
    pub fn validate_password(&self, password: &[u8]) -> bool {
        let mut mac = match Hmac::<Md5>::new_from_slice(password) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(self.challenge.as_bytes());
        let digest = data_encoding::HEXLOWER.encode(&mac.finalize().into_bytes());
        digest.eq_ignore_ascii_case(&self.response_digest)
    }
}

/// Successful authentication: the identity to attach to the session
/// and an optional 235 response text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub user: String,
    pub message: Option<String>,
}

impl AuthOutcome {
    pub fn user<S: Into<String>>(user: S) -> Self {
        Self {
            user: user.into(),
            message: None,
        }
    }
}

/// Verdict for a received message.
#[derive(Debug, Clone)]
pub enum DataReply {
    /// Accept, with an optional 250 text. In LMTP mode the acceptance
    /// is broadcast to every recipient.
    Accepted(Option<String>),
    /// Refuse the whole message.
    Rejected(RejectError),
    /// LMTP only: one verdict per recipient, in RCPT order. Scalar
    /// replies broadcast; a missing entry is answered 450.
    PerRecipient(Vec<Result<String, RejectError>>),
}

/// The contract a host application implements to put policy behind
/// the listener. Every callback runs on the connection's task, so a
/// slow handler slows only its own client.
#[async_trait]
pub trait SmtpHandler: Send + Sync + 'static {
    /// Called after reverse DNS, before the 220 greeting. An error
    /// refuses the connection with its code and message.
    async fn on_connect(&self, _session: &Session) -> Result<(), RejectError> {
        Ok(())
    }

    /// Called after any TLS handshake completes (implicit or
    /// STARTTLS).
    async fn on_secure(&self, _session: &Session) -> Result<(), RejectError> {
        Ok(())
    }

    /// Called per AUTH attempt with the mechanism-specific material.
    async fn on_auth(
        &self,
        _request: AuthRequest,
        _session: &Session,
    ) -> Result<AuthOutcome, RejectError> {
        Err(RejectError::new(535, "Error: authentication failed"))
    }

    /// Sender policy, called after parameter validation.
    async fn on_mail_from(
        &self,
        _from: &crate::session::MailPath,
        _session: &Session,
    ) -> Result<(), RejectError> {
        Ok(())
    }

    /// Recipient policy, called after parameter validation.
    async fn on_rcpt_to(
        &self,
        _rcpt: &crate::session::MailPath,
        _session: &Session,
    ) -> Result<(), RejectError> {
        Ok(())
    }

    /// Consume the message body. Runs while the body is still being
    /// received; the stream MUST be read to EOF before returning.
    async fn on_data(&self, body: BodyStream, session: &Session) -> DataReply;

    /// Called exactly once when the connection goes away.
    async fn on_close(&self, _session: &Session) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cram_md5_digest_round_trip() {
        // RFC 2195 worked example
        let validation = CramMd5Validation {
            challenge: "<1896.697170952@postoffice.reston.mci.net>".to_string(),
            response_digest: "b913a602c7eda7a495b4e6e7334d3890".to_string(),
        };
        assert!(validation.validate_password(b"tanstaaftanstaaf"));
        assert!(!validation.validate_password(b"wrong"));
    }

    #[test]
    fn cram_md5_digest_is_case_insensitive() {
        let validation = CramMd5Validation {
            challenge: "<1896.697170952@postoffice.reston.mci.net>".to_string(),
            response_digest: "B913A602C7EDA7A495B4E6E7334D3890".to_string(),
        };
        assert!(validation.validate_password(b"tanstaaftanstaaf"));
    }
}
