//! An embeddable SMTP and LMTP listener for tokio.
//!
//! The library owns the wire protocol: connection admission, ESMTP
//! extension negotiation, SASL authentication, STARTTLS, the MAIL/
//! RCPT/DATA transaction lifecycle and graceful shutdown. Everything
//! with a policy flavor is delegated to a host-supplied
//! [`SmtpHandler`]: credential checks, sender/recipient decisions and
//! consumption of the message body, which is streamed to the handler
//! while it is still being received.
//!
//! ```no_run
//! use mailgate::{BodyStream, DataReply, Server, ServerOptions, SmtpHandler};
//! use tokio::io::AsyncReadExt;
//!
//! struct Sink;
//!
//! #[async_trait::async_trait]
//! impl SmtpHandler for Sink {
//!     async fn on_data(
//!         &self,
//!         mut body: BodyStream,
//!         _session: &mailgate::Session,
//!     ) -> DataReply {
//!         let mut message = Vec::new();
//!         if body.read_to_end(&mut message).await.is_err() {
//!             return DataReply::Rejected(mailgate::RejectError::new(451, "read failed"));
//!         }
//!         DataReply::Accepted(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = ServerOptions {
//!         auth_optional: true,
//!         ..ServerOptions::default()
//!     };
//!     let server = Server::bind("127.0.0.1:2525", options, Sink).await?;
//!     server.run().await
//! }
//! ```

mod config;
mod connection;
mod dns;
mod handler;
mod metrics;
mod sasl;
mod server;
mod session;
mod stream;
mod tls;

pub use config::{KeySource, Mechanism, ProxyTrust, ServerOptions, TlsKeyPair, TlsSettings};
pub use dns::{HickoryReverseLookup, ReverseLookup};
pub use handler::{AuthOutcome, AuthRequest, CramMd5Validation, DataReply, RejectError, SmtpHandler};
pub use server::{Server, ServerEvent};
pub use session::{BodyType, DsnRet, Envelope, Greeting, MailPath, Session, TlsInfo};
pub use smtp_stream::BodyStream;
