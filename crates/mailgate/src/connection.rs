use crate::config::Mechanism;
use crate::handler::{AuthRequest, DataReply};
use crate::metrics::TOTAL_MESSAGES;
use crate::sasl::{self, SaslState, SaslStep};
use crate::server::{Phase, ServerContext, ServerEvent};
use crate::session::{canonical_ip, BodyType, DsnRet, Greeting, Session};
use crate::stream::{BoxedStream, Rewind};
use crate::tls::capture_tls_info;
use smtp_proto::{
    parse_attributes, parse_mail_from, parse_rcpt_to, Command, EnhancedStatusCode, ParamValue,
    ProxyHeader, Response,
};
use smtp_stream::{body_channel, DataProgress, FrameParser};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

/// Hard cap on a single command line. The data phase is unaffected.
const MAX_COMMAND_LINE: usize = 32 * 1024;
/// A PROXY v1 header fits in 107 bytes; anything near this is noise.
const MAX_PROXY_LINE: usize = 256;
const BODY_CHANNEL_DEPTH: usize = 32;

const XCLIENT_KEYS: &[&str] = &[
    "NAME", "ADDR", "PORT", "PROTO", "HELO", "LOGIN", "DESTADDR", "DESTPORT",
];
const XFORWARD_KEYS: &[&str] = &["NAME", "ADDR", "PORT", "PROTO", "HELO", "IDENT", "SOURCE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub(crate) struct Connection {
    ctx: Arc<ServerContext>,
    stream: Option<BoxedStream>,
    parser: FrameParser,
    session: Session,
    sasl: Option<SaslState>,
    unauthenticated: usize,
    unrecognized: usize,
    xclient_addr_used: bool,
    /// An overlong line was already answered; swallow the rest of it.
    discard_line: bool,
}

impl Connection {
    /// Serve one accepted socket to completion. Never returns an
    /// error: whatever happens, the session is logged and `on_close`
    /// fires exactly once.
    pub(crate) async fn run(ctx: Arc<ServerContext>, socket: TcpStream, peer: SocketAddr) {
        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(err) => {
                tracing::debug!("could not determine local address: {err:#}");
                return;
            }
        };
        socket.set_nodelay(true).ok();

        let session = Session::new(
            (local.ip(), local.port()),
            (peer.ip(), peer.port()),
            ctx.options.lmtp,
        );
        let id = session.id.clone();
        ctx.register_connection(&id);
        tracing::debug!("{id} connection from {peer}");

        let mut conn = Connection {
            ctx: ctx.clone(),
            stream: None,
            parser: FrameParser::new(),
            session,
            sasl: None,
            unauthenticated: 0,
            unrecognized: 0,
            xclient_addr_used: false,
            discard_line: false,
        };

        let mut force_rx = ctx.phase.subscribe();
        let mut forced = false;
        let result = {
            let serve = conn.serve(socket);
            tokio::pin!(serve);
            tokio::select! {
                result = &mut serve => result,
                _ = wait_for_force(&mut force_rx) => {
                    forced = true;
                    Ok(())
                }
            }
        };
        if forced {
            conn.write_response(&Response::new(421, "Server shutting down"))
                .await
                .ok();
        }

        if let Err(err) = result {
            if conn.session.envelope.mail_from.is_some() {
                tracing::warn!("{id} transport error mid-transaction: {err:#}");
                ctx.emit(ServerEvent::ConnectionError {
                    session_id: id.clone(),
                    error: format!("{err:#}"),
                });
            } else {
                tracing::debug!("{id} transport error: {err:#}");
            }
        }

        if let Some(mut stream) = conn.stream.take() {
            stream.shutdown().await.ok();
        }
        ctx.handler.on_close(&conn.session).await;
        ctx.deregister_connection(&id);
        tracing::debug!("{id} closed");
    }

    async fn serve(&mut self, socket: TcpStream) -> anyhow::Result<()> {
        // PROXY prelude arrives on the raw socket, before TLS
        let stream: BoxedStream = if self
            .ctx
            .options
            .use_proxy
            .applies_to(self.session.remote_address)
        {
            let (header, leftover, socket) =
                read_proxy_header(socket, self.ctx.options.socket_timeout).await?;
            if let Some(addrs) = header.addresses {
                tracing::debug!(
                    "{} PROXY override: peer is {}:{}",
                    self.session.id,
                    addrs.source,
                    addrs.source_port
                );
                self.session
                    .override_remote(addrs.source, Some(addrs.source_port));
                self.session.local_address = canonical_ip(addrs.destination);
                self.session.local_port = addrs.destination_port;
            }
            Box::new(Rewind::new(leftover, socket))
        } else {
            Box::new(socket)
        };
        self.stream = Some(stream);

        if self.ctx.options.secure || self.ctx.options.needs_upgrade {
            if self.upgrade_tls().await? == Flow::Quit {
                return Ok(());
            }
        }

        self.resolve_client_hostname().await;

        if let Err(reject) = self.ctx.handler.on_connect(&self.session).await {
            let code = if reject.code >= 400 { reject.code } else { 554 };
            self.write_response(&Response::new(code, reject.message))
                .await?;
            return Ok(());
        }

        if self.early_talker().await? {
            tracing::debug!("{} spoke before the greeting", self.session.id);
            self.write_response(&Response::new(
                421,
                format!("{} You talk too soon", self.ctx.server_name),
            ))
            .await?;
            return Ok(());
        }

        let greeting = self.greeting();
        self.write_response(&greeting).await?;

        self.command_loop().await
    }

    async fn command_loop(&mut self) -> anyhow::Result<()> {
        let mut phase_rx = self.ctx.phase.subscribe();
        let socket_timeout = self.ctx.options.socket_timeout;
        let mut buf = vec![0u8; 4096];

        loop {
            while let Some(line) = self.parser.next_line() {
                if self.discard_line {
                    // tail of a line that was already answered 500
                    self.discard_line = false;
                    continue;
                }
                if *phase_rx.borrow() == Phase::Force {
                    self.write_response(&Response::new(421, "Server shutting down"))
                        .await?;
                    return Ok(());
                }
                if self.dispatch(line).await? == Flow::Quit {
                    return Ok(());
                }
            }

            if self.parser.buffered() > MAX_COMMAND_LINE {
                self.parser.clear();
                if !self.discard_line {
                    self.discard_line = true;
                    if self.bump_unrecognized() {
                        self.write_response(&Response::new(
                            421,
                            "Error: too many unrecognized commands",
                        ))
                        .await?;
                        return Ok(());
                    }
                    self.write_response(&Response::new(500, "Error: line too long"))
                        .await?;
                }
            }

            let read = tokio::select! {
                _ = phase_rx.changed() => None,
                read = timeout(socket_timeout, read_some(self.stream.as_mut(), &mut buf)) => {
                    Some(read)
                }
            };
            // a Draining phase change lands here too; those sessions
            // keep being served until the close grace period expires
            let Some(read) = read else {
                if *phase_rx.borrow() == Phase::Force {
                    self.write_response(&Response::new(421, "Server shutting down"))
                        .await?;
                    return Ok(());
                }
                continue;
            };

            match read {
                Err(_) => {
                    self.write_response(&Response::new(421, "Timeout - closing connection"))
                        .await?;
                    return Ok(());
                }
                Ok(Ok(0)) => {
                    if let Some(line) = self.parser.take_eof_line() {
                        self.dispatch(line).await?;
                    }
                    return Ok(());
                }
                Ok(Ok(n)) => self.parser.feed(&buf[..n]),
                Ok(Err(err)) => return Err(err),
            }
        }
    }

    async fn dispatch(&mut self, line: Vec<u8>) -> anyhow::Result<Flow> {
        let text = String::from_utf8_lossy(&line).into_owned();
        tracing::trace!("{} C: {}", self.session.id, text.trim_end());

        if let Some(state) = self.sasl.take() {
            let step = sasl::advance(state, &text);
            return self.apply_sasl_step(step).await;
        }

        let cmd = Command::parse(&text);

        if matches!(cmd, Command::Empty) {
            self.write_response(&Response::new(500, "Error: bad syntax"))
                .await?;
            return Ok(Flow::Continue);
        }

        if matches!(cmd, Command::Http { .. }) {
            self.write_response(&Response::new(421, "HTTP requests not allowed"))
                .await?;
            return Ok(Flow::Quit);
        }

        let unknown = matches!(cmd, Command::Unknown { .. })
            || self.ctx.options.command_disabled(cmd.verb())
            || (matches!(cmd, Command::Lhlo { .. }) && !self.ctx.options.lmtp)
            || (matches!(cmd, Command::XClient { .. }) && !self.ctx.options.use_xclient)
            || (matches!(cmd, Command::XForward { .. }) && !self.ctx.options.use_xforward);
        if unknown {
            if self.bump_unrecognized() {
                self.write_response(&Response::new(421, "Error: too many unrecognized commands"))
                    .await?;
                return Ok(Flow::Quit);
            }
            self.write_response(&Response::new(500, "Error: command not recognized"))
                .await?;
            return Ok(Flow::Continue);
        }

        if self.auth_required() && !matches!(cmd, Command::Auth { .. }) {
            self.unauthenticated += 1;
            if self.unauthenticated >= self.ctx.options.max_unauthenticated_commands {
                self.write_response(&Response::new(
                    421,
                    "Error: too many unauthenticated commands",
                ))
                .await?;
                return Ok(Flow::Quit);
            }
        }

        match cmd {
            Command::Helo { hostname } => self.cmd_greeting(Greeting::Helo, hostname).await,
            Command::Ehlo { hostname } => self.cmd_greeting(Greeting::Ehlo, hostname).await,
            Command::Lhlo { hostname } => self.cmd_greeting(Greeting::Lhlo, hostname).await,
            Command::Mail { line } => self.cmd_mail(&line).await,
            Command::Rcpt { line } => self.cmd_rcpt(&line).await,
            Command::Data => self.cmd_data().await,
            Command::Rset => {
                self.session.reset_envelope();
                self.write_response(&Response::new(250, "OK")).await?;
                Ok(Flow::Continue)
            }
            Command::Noop => {
                self.write_response(&Response::new(250, "OK")).await?;
                Ok(Flow::Continue)
            }
            Command::Quit => {
                self.write_response(&Response::new(221, "Bye")).await?;
                Ok(Flow::Quit)
            }
            Command::Vrfy => {
                self.write_response(&Response::new(
                    252,
                    "Cannot VRFY user, but will accept message and attempt delivery",
                ))
                .await?;
                Ok(Flow::Continue)
            }
            Command::Help => {
                self.write_response(&Response::new(214, "See RFC 5321 for details"))
                    .await?;
                Ok(Flow::Continue)
            }
            Command::StartTls => self.cmd_starttls().await,
            Command::Auth { args } => self.cmd_auth(args).await,
            Command::XClient { line } => self.cmd_xclient(&line).await,
            Command::XForward { line } => self.cmd_xforward(&line).await,
            Command::Empty | Command::Http { .. } | Command::Unknown { .. } => unreachable!(),
        }
    }

    async fn cmd_greeting(
        &mut self,
        greeting: Greeting,
        hostname: Option<String>,
    ) -> anyhow::Result<Flow> {
        if self.ctx.options.lmtp != matches!(greeting, Greeting::Lhlo) {
            self.write_response(&Response::new(500, "Error: invalid command"))
                .await?;
            return Ok(Flow::Continue);
        }
        let verb = match greeting {
            Greeting::Helo => "HELO",
            Greeting::Ehlo => "EHLO",
            Greeting::Lhlo => "LHLO",
        };
        let Some(hostname) = hostname else {
            self.write_response(&Response::new(501, format!("Error: syntax: {verb} hostname")))
                .await?;
            return Ok(Flow::Continue);
        };

        self.session.opening_command = Some(greeting);
        self.session.host_name_appears_as = Some(hostname.to_ascii_lowercase());
        self.session.reset_envelope();

        let response = match greeting {
            Greeting::Helo => Response::new(
                250,
                format!(
                    "{} Nice to meet you, {}",
                    self.ctx.server_name, self.session.client_hostname
                ),
            ),
            Greeting::Ehlo | Greeting::Lhlo => Response::lines(250, &self.ehlo_lines()),
        };
        self.write_bare_response(&response).await?;
        Ok(Flow::Continue)
    }

    fn ehlo_lines(&self) -> Vec<String> {
        let opts = &self.ctx.options;
        let mut lines = vec![format!(
            "{} Nice to meet you, {}",
            self.ctx.server_name, self.session.client_hostname
        )];
        if !opts.hide_pipelining {
            lines.push("PIPELINING".to_string());
        }
        if !opts.hide_eightbitmime {
            lines.push("8BITMIME".to_string());
        }
        if !opts.hide_smtputf8 {
            lines.push("SMTPUTF8".to_string());
        }
        if opts.enable_enhanced_status_codes && !opts.hide_enhanced_status_codes {
            lines.push("ENHANCEDSTATUSCODES".to_string());
        }
        if opts.enable_dsn && !opts.hide_dsn {
            lines.push("DSN".to_string());
        }
        if self.session.user.is_none()
            && !opts.auth_methods.is_empty()
            && (self.session.secure || opts.allow_insecure_auth)
        {
            let methods: Vec<&str> = opts.auth_methods.iter().map(|m| m.as_str()).collect();
            lines.push(format!("AUTH {}", methods.join(" ")));
        }
        if !self.session.secure && !opts.hide_starttls && !opts.command_disabled("STARTTLS") {
            lines.push("STARTTLS".to_string());
        }
        if let Some(size) = opts.size {
            lines.push(if opts.hide_size {
                "SIZE".to_string()
            } else {
                format!("SIZE {size}")
            });
        }
        if opts.enable_requiretls && !opts.hide_requiretls {
            lines.push("REQUIRETLS".to_string());
        }
        if opts.use_xclient && !self.xclient_addr_used {
            lines.push(format!("XCLIENT {}", XCLIENT_KEYS.join(" ")));
        }
        if opts.use_xforward && !self.xclient_addr_used {
            lines.push(format!("XFORWARD {}", XFORWARD_KEYS.join(" ")));
        }
        lines
    }

    async fn cmd_mail(&mut self, line: &str) -> anyhow::Result<Flow> {
        if self.session.opening_command.is_none() {
            self.write_response(&Response::new(503, "Error: send HELO/EHLO first"))
                .await?;
            return Ok(Flow::Continue);
        }
        if self.auth_required() {
            self.write_response(&Response::new(530, "Error: authentication Required"))
                .await?;
            return Ok(Flow::Continue);
        }
        if self.session.envelope.mail_from.is_some() {
            self.write_response(&Response::new(503, "Error: nested MAIL command"))
                .await?;
            return Ok(Flow::Continue);
        }

        let path = match parse_mail_from(line) {
            Ok(path) => path,
            Err(err) => {
                self.write_response(&Response::new(err.response_code(), err.to_string()))
                    .await?;
                return Ok(Flow::Continue);
            }
        };

        if let (Some(limit), false) = (self.ctx.options.size, self.ctx.options.hide_size) {
            if let Some(ParamValue::Value(value)) = path.args.get("SIZE") {
                match value.parse::<u64>() {
                    Ok(declared) if declared > limit => {
                        self.write_response(&Response::new(
                            552,
                            "Error: message exceeds fixed maximum message size",
                        ))
                        .await?;
                        return Ok(Flow::Continue);
                    }
                    Ok(_) => {}
                    Err(_) => {
                        self.write_response(&Response::new(501, "Error: invalid SIZE value"))
                            .await?;
                        return Ok(Flow::Continue);
                    }
                }
            }
        }

        let mut body_type = None;
        if let Some(value) = path.args.get("BODY") {
            body_type = match value.as_str().map(|v| v.to_ascii_uppercase()).as_deref() {
                Some("7BIT") => Some(BodyType::SevenBit),
                Some("8BITMIME") => Some(BodyType::EightBitMime),
                _ => {
                    self.write_response(&Response::new(
                        501,
                        "Error: invalid BODY parameter, must be 7BIT or 8BITMIME",
                    ))
                    .await?;
                    return Ok(Flow::Continue);
                }
            };
        }

        let mut smtp_utf8 = false;
        if let Some(value) = path.args.get("SMTPUTF8") {
            if !matches!(value, ParamValue::Flag) {
                self.write_response(&Response::new(501, "Error: SMTPUTF8 takes no value"))
                    .await?;
                return Ok(Flow::Continue);
            }
            smtp_utf8 = true;
        }

        let mut require_tls = false;
        if self.ctx.options.enable_requiretls {
            if let Some(value) = path.args.get("REQUIRETLS") {
                if !matches!(value, ParamValue::Flag) {
                    self.write_response(&Response::new(501, "Error: REQUIRETLS takes no value"))
                        .await?;
                    return Ok(Flow::Continue);
                }
                if !self.session.secure {
                    let refused =
                        Response::new(530, "Error: REQUIRETLS not permitted on non-TLS connections")
                            .with_enhanced_code(EnhancedStatusCode::new(5, 7, 30));
                    self.write_response(&refused).await?;
                    return Ok(Flow::Continue);
                }
                require_tls = true;
            }
        }

        let mut dsn_ret = None;
        if let Some(value) = path.args.get("RET") {
            dsn_ret = match value.as_str().map(|v| v.to_ascii_uppercase()).as_deref() {
                Some("FULL") => Some(DsnRet::Full),
                Some("HDRS") => Some(DsnRet::Hdrs),
                _ => {
                    self.write_response(&Response::new(501, "Error: invalid RET parameter"))
                        .await?;
                    return Ok(Flow::Continue);
                }
            };
        }

        let mut dsn_envid = None;
        if let Some(value) = path.args.get("ENVID") {
            match value.as_str() {
                Some(envid) if envid.len() <= 100 => dsn_envid = Some(envid.to_string()),
                Some(_) => {
                    self.write_response(&Response::new(501, "Error: ENVID is too long"))
                        .await?;
                    return Ok(Flow::Continue);
                }
                None => {
                    self.write_response(&Response::new(501, "Error: ENVID requires a value"))
                        .await?;
                    return Ok(Flow::Continue);
                }
            }
        }

        if let Err(reject) = self.ctx.handler.on_mail_from(&path, &self.session).await {
            let code = if reject.code >= 400 { reject.code } else { 550 };
            self.write_response(&Response::new(code, reject.message))
                .await?;
            return Ok(Flow::Continue);
        }

        tracing::debug!("{} MAIL FROM:<{}>", self.session.id, path.address);
        let envelope = &mut self.session.envelope;
        envelope.mail_from = Some(path);
        envelope.body_type = body_type;
        envelope.smtp_utf8 = smtp_utf8;
        envelope.require_tls = require_tls;
        envelope.dsn_ret = dsn_ret;
        envelope.dsn_envid = dsn_envid;
        let accepted =
            Response::new(250, "Accepted").with_enhanced_code(EnhancedStatusCode::new(2, 1, 0));
        self.write_response(&accepted).await?;
        Ok(Flow::Continue)
    }

    async fn cmd_rcpt(&mut self, line: &str) -> anyhow::Result<Flow> {
        if self.session.opening_command.is_none() {
            self.write_response(&Response::new(503, "Error: send HELO/EHLO first"))
                .await?;
            return Ok(Flow::Continue);
        }
        if self.auth_required() {
            self.write_response(&Response::new(530, "Error: authentication Required"))
                .await?;
            return Ok(Flow::Continue);
        }
        if self.session.envelope.mail_from.is_none() {
            self.write_response(&Response::new(503, "Error: need MAIL command"))
                .await?;
            return Ok(Flow::Continue);
        }
        if let Some(max) = self.ctx.options.max_recipients {
            if self.session.envelope.rcpt_to.len() >= max {
                self.write_response(&Response::new(452, "Error: too many recipients"))
                    .await?;
                return Ok(Flow::Continue);
            }
        }

        let path = match parse_rcpt_to(line) {
            Ok(path) => path,
            Err(err) => {
                self.write_response(&Response::new(err.response_code(), err.to_string()))
                    .await?;
                return Ok(Flow::Continue);
            }
        };

        if let Some(value) = path.args.get("NOTIFY") {
            if !valid_notify(value) {
                self.write_response(&Response::new(501, "Error: invalid NOTIFY parameter"))
                    .await?;
                return Ok(Flow::Continue);
            }
        }
        if let Some(ParamValue::Flag) = path.args.get("ORCPT") {
            self.write_response(&Response::new(501, "Error: ORCPT requires a value"))
                .await?;
            return Ok(Flow::Continue);
        }

        if let Err(reject) = self.ctx.handler.on_rcpt_to(&path, &self.session).await {
            let code = if reject.code >= 400 { reject.code } else { 550 };
            self.write_response(&Response::new(code, reject.message))
                .await?;
            return Ok(Flow::Continue);
        }

        tracing::debug!("{} RCPT TO:<{}>", self.session.id, path.address);
        self.session.envelope.add_rcpt(path);
        let accepted =
            Response::new(250, "Accepted").with_enhanced_code(EnhancedStatusCode::new(2, 1, 5));
        self.write_response(&accepted).await?;
        Ok(Flow::Continue)
    }

    async fn cmd_data(&mut self) -> anyhow::Result<Flow> {
        if self.session.opening_command.is_none() {
            self.write_response(&Response::new(503, "Error: send HELO/EHLO first"))
                .await?;
            return Ok(Flow::Continue);
        }
        if self.auth_required() {
            self.write_response(&Response::new(530, "Error: authentication Required"))
                .await?;
            return Ok(Flow::Continue);
        }
        if self.session.envelope.rcpt_to.is_empty() {
            self.write_response(&Response::new(503, "Error: need RCPT command"))
                .await?;
            return Ok(Flow::Continue);
        }
        self.data_phase().await
    }

    async fn data_phase(&mut self) -> anyhow::Result<Flow> {
        self.write_response(&Response::new(354, "End data with <CR><LF>.<CR><LF>"))
            .await?;
        self.parser.begin_data(self.ctx.options.size);

        let (body_tx, body) = body_channel(BODY_CHANNEL_DEPTH);
        let handler = self.ctx.handler.clone();
        let session_view = self.session.clone();
        let mut data_fut = Box::pin(async move { handler.on_data(body, &session_view).await });

        let mut reply: Option<DataReply> = None;
        let mut sender = Some(body_tx);
        let socket_timeout = self.ctx.options.socket_timeout;
        let mut buf = vec![0u8; 4096];
        let mut chunk = Vec::with_capacity(8192);

        let completed = loop {
            chunk.clear();
            let progress = self.parser.drain_data(&mut chunk);

            if !chunk.is_empty() {
                let mut reader_gone = false;
                if let Some(tx) = &sender {
                    let send_fut = tx.send(std::mem::take(&mut chunk));
                    tokio::pin!(send_fut);
                    loop {
                        tokio::select! {
                            result = &mut data_fut, if reply.is_none() => reply = Some(result),
                            result = &mut send_fut => {
                                reader_gone = result.is_err();
                                break;
                            }
                        }
                    }
                }
                if reader_gone {
                    // handler stopped reading early; keep consuming
                    // the wire up to the terminator
                    sender = None;
                }
            }

            if progress == DataProgress::Complete {
                break true;
            }

            let read = tokio::select! {
                result = &mut data_fut, if reply.is_none() => {
                    reply = Some(result);
                    continue;
                }
                read = timeout(socket_timeout, read_some(self.stream.as_mut(), &mut buf)) => read,
            };
            match read {
                Err(_) => {
                    self.write_response(&Response::new(421, "Timeout - closing connection"))
                        .await?;
                    return Ok(Flow::Quit);
                }
                Ok(Ok(0)) => break false,
                Ok(Ok(n)) => self.parser.feed(&buf[..n]),
                Ok(Err(err)) => return Err(err),
            }
        };

        if !completed {
            anyhow::bail!("connection closed during message data");
        }

        let bytes = self.parser.data_bytes();
        let exceeded = self.parser.size_exceeded();
        if let Some(tx) = sender.take() {
            tx.finish(bytes, exceeded);
        }

        let reply = match reply.take() {
            Some(reply) => reply,
            None => data_fut.await,
        };

        let rcpt_count = self.session.envelope.rcpt_to.len();
        tracing::debug!(
            "{} message received: {bytes} bytes for {rcpt_count} recipients",
            self.session.id
        );

        let fanout = if self.ctx.options.lmtp { rcpt_count } else { 1 };
        let responses: Vec<Response> = if exceeded {
            (0..fanout)
                .map(|_| Response::new(552, "Error: message exceeds fixed maximum message size"))
                .collect()
        } else {
            match reply {
                DataReply::Accepted(message) => {
                    let text = message.unwrap_or_else(|| "OK: message queued".to_string());
                    (0..fanout).map(|_| Response::new(250, text.clone())).collect()
                }
                DataReply::Rejected(reject) => {
                    let code = if reject.code >= 400 { reject.code } else { 450 };
                    (0..fanout)
                        .map(|_| Response::new(code, reject.message.clone()))
                        .collect()
                }
                DataReply::PerRecipient(verdicts) => (0..fanout)
                    .map(|i| match verdicts.get(i) {
                        Some(Ok(message)) => Response::new(250, message.clone()),
                        Some(Err(reject)) => Response::new(
                            if reject.code >= 400 { reject.code } else { 450 },
                            reject.message.clone(),
                        ),
                        None => Response::new(450, "Error: no response for recipient"),
                    })
                    .collect(),
            }
        };

        let accepted = responses.iter().any(|r| !r.is_error());
        for response in &responses {
            self.write_response(response).await?;
        }

        if accepted {
            TOTAL_MESSAGES.inc();
            self.session.transaction += 1;
            self.unrecognized = 0;
        }
        self.session.reset_envelope();
        self.parser.resume();
        Ok(Flow::Continue)
    }

    async fn cmd_starttls(&mut self) -> anyhow::Result<Flow> {
        if self.session.secure {
            self.write_response(&Response::new(503, "Error: TLS already active"))
                .await?;
            return Ok(Flow::Continue);
        }
        self.write_response(&Response::new(220, "Ready to start TLS"))
            .await?;
        // RFC 3207: anything pipelined after STARTTLS must not be
        // interpreted as commands
        self.parser.clear();
        self.upgrade_tls().await
    }

    async fn upgrade_tls(&mut self) -> anyhow::Result<Flow> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| anyhow::anyhow!("connection stream detached"))?;
        match self.ctx.tls_acceptor.accept(stream).await {
            Ok(tls) => {
                let info = capture_tls_info(tls.get_ref().1);
                tracing::debug!(
                    "{} TLS established: {} {}",
                    self.session.id,
                    info.protocol,
                    info.cipher
                );
                self.stream = Some(Box::new(tls));
                self.session.secure = true;
                self.session.tls_info = Some(info);
                if let Err(reject) = self.ctx.handler.on_secure(&self.session).await {
                    let code = if reject.code >= 400 { reject.code } else { 554 };
                    self.write_response(&Response::new(code, reject.message))
                        .await?;
                    return Ok(Flow::Quit);
                }
                Ok(Flow::Continue)
            }
            Err(err) => {
                tracing::debug!("{} TLS handshake failed: {err:#}", self.session.id);
                Ok(Flow::Quit)
            }
        }
    }

    async fn cmd_auth(&mut self, args: Vec<String>) -> anyhow::Result<Flow> {
        if self.session.opening_command.is_none() {
            self.write_response(&Response::new(503, "Error: send HELO/EHLO first"))
                .await?;
            return Ok(Flow::Continue);
        }
        if self.session.user.is_some() {
            self.write_response(&Response::new(503, "Error: No identity changes permitted"))
                .await?;
            return Ok(Flow::Continue);
        }
        if self.ctx.options.auth_methods.is_empty() {
            self.write_response(&Response::new(503, "Error: authentication not enabled"))
                .await?;
            return Ok(Flow::Continue);
        }
        if !self.session.secure && !self.ctx.options.allow_insecure_auth {
            self.write_response(&Response::new(
                538,
                "Error: Must issue a STARTTLS command first",
            ))
            .await?;
            return Ok(Flow::Continue);
        }
        let Some(token) = args.first() else {
            self.write_response(&Response::new(501, "Error: syntax: AUTH mechanism"))
                .await?;
            return Ok(Flow::Continue);
        };
        let mechanism = Mechanism::from_token(token)
            .filter(|m| self.ctx.options.auth_methods.contains(m));
        let Some(mechanism) = mechanism else {
            self.write_response(&Response::new(504, "Error: Unrecognized authentication type"))
                .await?;
            return Ok(Flow::Continue);
        };

        let step = sasl::start(
            mechanism,
            args.get(1).map(String::as_str),
            &self.ctx.server_name,
        );
        self.apply_sasl_step(step).await
    }

    async fn apply_sasl_step(&mut self, step: SaslStep) -> anyhow::Result<Flow> {
        match step {
            SaslStep::Challenge(response, state) => {
                self.sasl = Some(state);
                self.write_response(&response).await?;
            }
            SaslStep::Respond(response) => {
                self.write_response(&response).await?;
            }
            SaslStep::Authenticate(request) => {
                let mechanism = request.mechanism;
                match self.ctx.handler.on_auth(request, &self.session).await {
                    Ok(outcome) => {
                        tracing::debug!("{} authenticated as {}", self.session.id, outcome.user);
                        self.session.user = Some(outcome.user);
                        let text = outcome
                            .message
                            .unwrap_or_else(|| "Authentication successful".to_string());
                        self.write_response(&Response::new(235, text)).await?;
                    }
                    Err(reject) => {
                        let code = if reject.code >= 400 { reject.code } else { 535 };
                        let response = Response::new(code, reject.message);
                        if mechanism == Mechanism::XOAuth2 {
                            let (challenge, state) = sasl::xoauth_failure(response);
                            self.sasl = Some(state);
                            self.write_response(&challenge).await?;
                        } else {
                            self.write_response(&response).await?;
                        }
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn cmd_xclient(&mut self, line: &str) -> anyhow::Result<Flow> {
        if self.session.envelope.mail_from.is_some() {
            self.write_response(&Response::new(503, "Error: MAIL transaction in progress"))
                .await?;
            return Ok(Flow::Continue);
        }
        let attrs = match parse_attributes(line, XCLIENT_KEYS) {
            Ok(attrs) => attrs,
            Err(err) => {
                self.write_response(&Response::new(err.response_code(), err.to_string()))
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        if self.xclient_addr_used && attrs.iter().any(|a| a.key == "ADDR") {
            self.write_response(&Response::new(550, "Error: XCLIENT ADDR not allowed"))
                .await?;
            return Ok(Flow::Continue);
        }

        let mut new_addr: Option<IpAddr> = None;
        let mut new_port: Option<u16> = None;
        let mut name_change: Option<Option<String>> = None;
        let mut login_change: Option<Option<String>> = None;

        for attr in &attrs {
            match attr.key.as_str() {
                "ADDR" => {
                    if let Some(value) = &attr.value {
                        match parse_forwarded_ip(value) {
                            Some(ip) => new_addr = Some(ip),
                            None => {
                                self.write_response(&Response::new(
                                    501,
                                    "Error: invalid ADDR parameter",
                                ))
                                .await?;
                                return Ok(Flow::Continue);
                            }
                        }
                    }
                }
                "PORT" => {
                    if let Some(value) = &attr.value {
                        match value.parse::<u16>() {
                            Ok(port) => new_port = Some(port),
                            Err(_) => {
                                self.write_response(&Response::new(
                                    501,
                                    "Error: invalid PORT parameter",
                                ))
                                .await?;
                                return Ok(Flow::Continue);
                            }
                        }
                    }
                }
                "PROTO" => {
                    if let Some(value) = &attr.value {
                        let proto = value.to_ascii_uppercase();
                        if !matches!(proto.as_str(), "SMTP" | "ESMTP" | "LMTP") {
                            self.write_response(&Response::new(
                                501,
                                "Error: invalid PROTO parameter",
                            ))
                            .await?;
                            return Ok(Flow::Continue);
                        }
                        self.session.proto_override = Some(proto);
                    }
                }
                "NAME" => name_change = Some(attr.value.clone()),
                "HELO" => {
                    self.session.host_name_appears_as =
                        attr.value.as_ref().map(|v| v.to_ascii_lowercase());
                }
                "LOGIN" => login_change = Some(attr.value.clone()),
                "DESTADDR" | "DESTPORT" => {}
                _ => unreachable!(),
            }
        }

        for attr in &attrs {
            match &attr.value {
                Some(value) => {
                    self.session.xclient.insert(attr.key.clone(), value.clone());
                }
                None => {
                    self.session.xclient.remove(&attr.key);
                }
            }
        }

        let addr_applied = new_addr.is_some();
        if let Some(addr) = new_addr {
            tracing::debug!("{} XCLIENT ADDR override to {addr}", self.session.id);
            self.session.override_remote(addr, new_port);
            self.xclient_addr_used = true;
            self.resolve_client_hostname().await;
        }
        if let Some(name) = name_change {
            self.session.client_hostname =
                name.unwrap_or_else(|| format!("[{}]", self.session.remote_address));
        }
        if let Some(login) = login_change {
            match login {
                None => self.session.user = None,
                Some(user) => {
                    let request = AuthRequest {
                        mechanism: Mechanism::XClient,
                        username: Some(user),
                        password: None,
                        access_token: None,
                        cram: None,
                    };
                    match self.ctx.handler.on_auth(request, &self.session).await {
                        Ok(outcome) => self.session.user = Some(outcome.user),
                        Err(reject) => {
                            let code = if reject.code >= 400 { reject.code } else { 550 };
                            self.write_response(&Response::new(code, reject.message))
                                .await?;
                            return Ok(Flow::Continue);
                        }
                    }
                }
            }
        }

        if addr_applied {
            // the proxied client starts a fresh dialogue
            self.session.opening_command = None;
            self.session.reset_envelope();
            let greeting = self.greeting();
            self.write_response(&greeting).await?;
        } else {
            self.write_response(&Response::new(250, "OK")).await?;
        }
        Ok(Flow::Continue)
    }

    async fn cmd_xforward(&mut self, line: &str) -> anyhow::Result<Flow> {
        if self.session.envelope.mail_from.is_some() {
            self.write_response(&Response::new(503, "Error: MAIL transaction in progress"))
                .await?;
            return Ok(Flow::Continue);
        }
        let attrs = match parse_attributes(line, XFORWARD_KEYS) {
            Ok(attrs) => attrs,
            Err(err) => {
                self.write_response(&Response::new(err.response_code(), err.to_string()))
                    .await?;
                return Ok(Flow::Continue);
            }
        };

        let mut name_change: Option<Option<String>> = None;
        for attr in &attrs {
            match attr.key.as_str() {
                "ADDR" => {
                    if let Some(value) = &attr.value {
                        match parse_forwarded_ip(value) {
                            Some(ip) => self.session.override_remote(ip, None),
                            None => {
                                self.write_response(&Response::new(
                                    501,
                                    "Error: invalid ADDR parameter",
                                ))
                                .await?;
                                return Ok(Flow::Continue);
                            }
                        }
                    }
                }
                "PORT" => {
                    if let Some(value) = &attr.value {
                        match value.parse::<u16>() {
                            Ok(port) => self.session.remote_port = port,
                            Err(_) => {
                                self.write_response(&Response::new(
                                    501,
                                    "Error: invalid PORT parameter",
                                ))
                                .await?;
                                return Ok(Flow::Continue);
                            }
                        }
                    }
                }
                "NAME" => name_change = Some(attr.value.clone()),
                "HELO" => {
                    self.session.host_name_appears_as =
                        attr.value.as_ref().map(|v| v.to_ascii_lowercase());
                }
                "PROTO" | "IDENT" | "SOURCE" => {}
                _ => unreachable!(),
            }
        }

        for attr in &attrs {
            match &attr.value {
                Some(value) => {
                    self.session
                        .xforward
                        .insert(attr.key.clone(), value.clone());
                }
                None => {
                    self.session.xforward.remove(&attr.key);
                }
            }
        }
        if let Some(name) = name_change {
            self.session.client_hostname =
                name.unwrap_or_else(|| format!("[{}]", self.session.remote_address));
        }

        self.write_response(&Response::new(250, "OK")).await?;
        Ok(Flow::Continue)
    }

    async fn resolve_client_hostname(&mut self) {
        if self.ctx.options.disable_reverse_lookup {
            return;
        }
        let lookup = self
            .ctx
            .resolver
            .reverse_lookup(self.session.remote_address);
        match timeout(self.ctx.options.lookup_timeout, lookup).await {
            Ok(Ok(names)) => {
                if let Some(name) = names.into_iter().next() {
                    self.session.client_hostname = name;
                }
            }
            Ok(Err(err)) => {
                tracing::debug!("{} reverse lookup failed: {err:#}", self.session.id);
            }
            Err(_) => {
                tracing::debug!("{} reverse lookup timed out", self.session.id);
            }
        }
    }

    /// Did the peer send bytes before we greeted it?
    async fn early_talker(&mut self) -> anyhow::Result<bool> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("connection stream detached"))?;
        let mut buf = [0u8; 512];
        match timeout(Duration::from_millis(1), stream.read(&mut buf)).await {
            Ok(Ok(0)) => Ok(false),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Ok(false),
        }
    }

    fn greeting(&self) -> Response {
        let proto = if self.ctx.options.lmtp { "LMTP" } else { "ESMTP" };
        let text = match &self.ctx.options.banner {
            Some(banner) => format!("{} {proto} {banner}", self.ctx.server_name),
            None => format!("{} {proto}", self.ctx.server_name),
        };
        Response::new(220, text)
    }

    /// MAIL/RCPT/DATA are refused with 530 while credentials are
    /// outstanding.
    fn auth_required(&self) -> bool {
        self.session.user.is_none()
            && !self.ctx.options.auth_methods.is_empty()
            && !self.ctx.options.auth_optional
    }

    /// Returns true when the counter has crossed the limit and the
    /// connection should be dropped.
    fn bump_unrecognized(&mut self) -> bool {
        self.unrecognized += 1;
        self.unrecognized >= self.ctx.options.max_unrecognized_commands
    }

    /// Write a reply, applying enhanced-status-code policy: when the
    /// session advertises ENHANCEDSTATUSCODES, untagged replies get
    /// the RFC 3463 default for their code; when it does not, any
    /// site-specific tag is stripped.
    async fn write_response(&mut self, response: &Response) -> anyhow::Result<()> {
        let enabled = self.ctx.options.enable_enhanced_status_codes
            && !self.ctx.options.hide_enhanced_status_codes;
        if enabled {
            if response.enhanced_code.is_none() {
                if let Some(enhanced) = default_enhanced_code(response.code) {
                    let tagged = response.clone().with_enhanced_code(enhanced);
                    return self.send_response(&tagged).await;
                }
            }
            self.send_response(response).await
        } else if response.enhanced_code.is_some() {
            let mut bare = response.clone();
            bare.enhanced_code = None;
            self.send_response(&bare).await
        } else {
            self.send_response(response).await
        }
    }

    /// Write a reply exactly as built. RFC 2034 excludes the greeting
    /// and HELO/EHLO responses from enhanced-status tagging.
    async fn write_bare_response(&mut self, response: &Response) -> anyhow::Result<()> {
        self.send_response(response).await
    }

    async fn send_response(&mut self, response: &Response) -> anyhow::Result<()> {
        if response.is_error() {
            self.session.error = Some(response.to_string());
        }
        tracing::trace!("{} S: {response}", self.session.id);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("connection stream detached"))?;
        stream.write_all(response.render().as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}

async fn read_some(stream: Option<&mut BoxedStream>, buf: &mut [u8]) -> anyhow::Result<usize> {
    let stream = stream.ok_or_else(|| anyhow::anyhow!("connection stream detached"))?;
    Ok(stream.read(buf).await?)
}

async fn wait_for_force(rx: &mut watch::Receiver<Phase>) {
    loop {
        if *rx.borrow() == Phase::Force {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// RFC 3463 default for a reply code, used when the reply site did
/// not pick something more specific. The greeting and the 3xx
/// continuations never carry one.
fn default_enhanced_code(code: u16) -> Option<EnhancedStatusCode> {
    let (class, subject, detail) = match code {
        211 | 214 | 221 | 250 | 252 => (2, 0, 0),
        235 => (2, 7, 0),
        421 => (4, 3, 2),
        450 => (4, 2, 0),
        452 => (4, 5, 3),
        500 => (5, 5, 2),
        501 => (5, 5, 4),
        502 | 503 => (5, 5, 1),
        504 => (5, 7, 4),
        530 => (5, 7, 0),
        535 => (5, 7, 8),
        538 => (5, 7, 11),
        550 => (5, 7, 1),
        552 => (5, 3, 4),
        554 => (5, 0, 0),
        _ => return None,
    };
    Some(EnhancedStatusCode::new(class, subject, detail))
}

/// NOTIFY is a comma-separated subset of NEVER/SUCCESS/FAILURE/DELAY,
/// with NEVER only valid on its own.
fn valid_notify(value: &ParamValue) -> bool {
    let Some(value) = value.as_str() else {
        return false;
    };
    let parts: Vec<String> = value
        .split(',')
        .map(|p| p.trim().to_ascii_uppercase())
        .collect();
    if parts.iter().any(|p| p.is_empty()) {
        return false;
    }
    let all_known = parts
        .iter()
        .all(|p| matches!(p.as_str(), "NEVER" | "SUCCESS" | "FAILURE" | "DELAY"));
    let never = parts.iter().any(|p| p == "NEVER");
    all_known && (!never || parts.len() == 1)
}

/// XCLIENT/XFORWARD address values may carry Postfix's `IPV6:` prefix.
fn parse_forwarded_ip(value: &str) -> Option<IpAddr> {
    let value = if value.len() >= 5 && value[..5].eq_ignore_ascii_case("IPV6:") {
        &value[5..]
    } else {
        value
    };
    value.parse().ok().map(canonical_ip)
}

/// Consume the PROXY v1 line from the front of a fresh socket. Bytes
/// that arrived after the newline are returned for replay.
async fn read_proxy_header(
    mut socket: TcpStream,
    read_timeout: Duration,
) -> anyhow::Result<(ProxyHeader, Vec<u8>, TcpStream)> {
    let mut collected = Vec::with_capacity(128);
    let mut buf = [0u8; 128];
    let newline = loop {
        if let Some(i) = memchr::memchr(b'\n', &collected) {
            break i;
        }
        if collected.len() > MAX_PROXY_LINE {
            anyhow::bail!("PROXY header too long");
        }
        let n = timeout(read_timeout, socket.read(&mut buf))
            .await
            .map_err(|_| anyhow::anyhow!("timed out reading PROXY header"))??;
        if n == 0 {
            anyhow::bail!("connection closed while reading PROXY header");
        }
        collected.extend_from_slice(&buf[..n]);
    };

    let line = String::from_utf8_lossy(&collected[..newline]).into_owned();
    let leftover = collected.split_off(newline + 1);
    let header = ProxyHeader::parse(&line)
        .map_err(|err| anyhow::anyhow!("bad PROXY header from peer: {err}"))?;
    Ok((header, leftover, socket))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_enhanced_codes() {
        assert_eq!(
            default_enhanced_code(250),
            Some(EnhancedStatusCode::new(2, 0, 0))
        );
        assert_eq!(
            default_enhanced_code(535),
            Some(EnhancedStatusCode::new(5, 7, 8))
        );
        // greeting and continuations never carry one
        assert_eq!(default_enhanced_code(220), None);
        assert_eq!(default_enhanced_code(334), None);
        assert_eq!(default_enhanced_code(354), None);
    }

    #[test]
    fn notify_validation() {
        let value = |s: &str| ParamValue::Value(s.to_string());
        assert!(valid_notify(&value("NEVER")));
        assert!(valid_notify(&value("success,failure")));
        assert!(valid_notify(&value("SUCCESS,FAILURE,DELAY")));
        assert!(!valid_notify(&value("NEVER,SUCCESS")));
        assert!(!valid_notify(&value("SOMETIMES")));
        assert!(!valid_notify(&value("SUCCESS,,FAILURE")));
        assert!(!valid_notify(&ParamValue::Flag));
    }

    #[test]
    fn forwarded_ip_parsing() {
        assert_eq!(
            parse_forwarded_ip("192.0.2.1"),
            Some("192.0.2.1".parse().unwrap())
        );
        assert_eq!(
            parse_forwarded_ip("IPV6:2001:db8::1"),
            Some("2001:db8::1".parse().unwrap())
        );
        assert_eq!(
            parse_forwarded_ip("ipv6:::ffff:192.0.2.7"),
            Some("192.0.2.7".parse().unwrap())
        );
        assert_eq!(parse_forwarded_ip("not-an-ip"), None);
    }
}
