#![allow(dead_code)]

use async_trait::async_trait;
use mailgate::{
    AuthOutcome, AuthRequest, BodyStream, DataReply, Mechanism, RejectError, Server,
    ServerOptions, Session, SmtpHandler,
};
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// What the handler observed for one completed DATA phase.
#[derive(Debug, Clone)]
pub struct Received {
    pub from: String,
    pub to: Vec<String>,
    pub body: Vec<u8>,
    pub remote: SocketAddr,
    pub client_hostname: String,
    pub transmission: String,
    pub user: Option<String>,
}

#[derive(Default)]
pub struct HandlerState {
    pub received: Mutex<Vec<Received>>,
    pub closes: AtomicUsize,
}

/// Scriptable handler used by every integration test. Credentials are
/// joe/secret; recipients containing "deny" are refused.
#[derive(Default)]
pub struct TestHandler {
    pub state: Arc<HandlerState>,
    pub per_recipient: Option<Vec<Result<String, RejectError>>>,
    pub connect_delay: Option<Duration>,
}

impl TestHandler {
    pub fn new() -> (Self, Arc<HandlerState>) {
        let state = Arc::new(HandlerState::default());
        (
            Self {
                state: state.clone(),
                per_recipient: None,
                connect_delay: None,
            },
            state,
        )
    }
}

#[async_trait]
impl SmtpHandler for TestHandler {
    async fn on_connect(&self, _session: &Session) -> Result<(), RejectError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn on_auth(
        &self,
        request: AuthRequest,
        _session: &Session,
    ) -> Result<AuthOutcome, RejectError> {
        let ok = match request.mechanism {
            Mechanism::Plain | Mechanism::Login => {
                request.username.as_deref() == Some("joe")
                    && request.password.as_deref() == Some("secret")
            }
            Mechanism::XOAuth2 => request.access_token.as_deref() == Some("tok-ok"),
            Mechanism::CramMd5 => {
                request.username.as_deref() == Some("joe")
                    && request
                        .cram
                        .as_ref()
                        .is_some_and(|c| c.validate_password(b"secret"))
            }
            Mechanism::XClient => request.username.is_some(),
        };
        if ok {
            Ok(AuthOutcome::user(
                request.username.unwrap_or_else(|| "joe".to_string()),
            ))
        } else {
            Err(RejectError::new(535, "Error: authentication failed"))
        }
    }

    async fn on_rcpt_to(
        &self,
        rcpt: &mailgate::MailPath,
        _session: &Session,
    ) -> Result<(), RejectError> {
        if rcpt.address.contains("deny") {
            return Err(RejectError::new(550, "Error: mailbox unavailable"));
        }
        Ok(())
    }

    async fn on_data(&self, mut body: BodyStream, session: &Session) -> DataReply {
        let mut bytes = Vec::new();
        if body.read_to_end(&mut bytes).await.is_err() {
            return DataReply::Rejected(RejectError::new(451, "Error: read failure"));
        }
        self.state.received.lock().unwrap().push(Received {
            from: session
                .envelope
                .mail_from
                .as_ref()
                .map(|p| p.address.clone())
                .unwrap_or_default(),
            to: session
                .envelope
                .rcpt_to
                .iter()
                .map(|p| p.address.clone())
                .collect(),
            body: bytes,
            remote: SocketAddr::new(session.remote_address, session.remote_port),
            client_hostname: session.client_hostname.clone(),
            transmission: session.transmission_type(),
            user: session.user.clone(),
        });
        match &self.per_recipient {
            Some(verdicts) => DataReply::PerRecipient(verdicts.clone()),
            None => DataReply::Accepted(None),
        }
    }

    async fn on_close(&self, _session: &Session) {
        self.state
            .closes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Options most tests start from: fixed name, no DNS, no auth wall,
/// STARTTLS hidden so the EHLO response is stable.
pub fn base_options() -> ServerOptions {
    ServerOptions {
        name: Some("mx.test".to_string()),
        disable_reverse_lookup: true,
        auth_optional: true,
        hide_starttls: true,
        ..ServerOptions::default()
    }
}

pub async fn start_server(
    options: ServerOptions,
    handler: TestHandler,
) -> (Arc<Server>, SocketAddr, JoinHandle<anyhow::Result<()>>) {
    let server = Arc::new(
        Server::bind("127.0.0.1:0", options, handler)
            .await
            .expect("bind test server"),
    );
    let addr = server.local_addr();
    let task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    (server, addr, task)
}

/// A scripted SMTP client over a raw TCP stream.
pub struct TestClient {
    stream: BufReader<TcpStream>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn try_connect(addr: SocketAddr) -> Option<Self> {
        let stream = TcpStream::connect(addr).await.ok()?;
        Some(Self {
            stream: BufReader::new(stream),
        })
    }

    pub async fn send(&mut self, line: &str) {
        self.stream
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.get_mut().write_all(bytes).await.expect("write");
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await.expect("read line");
        assert!(n > 0, "connection closed while expecting a response");
        line.trim_end().to_string()
    }

    /// Read one full (possibly multi-line) response.
    pub async fn read_response(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.len() <= 4 || line.as_bytes()[3] == b' ';
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    /// Send a command and read its single-line reply.
    pub async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_line().await
    }

    /// True once the server has hung up.
    pub async fn expect_eof(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(self.stream.read(&mut buf).await, Ok(0))
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream.into_inner()
    }
}
