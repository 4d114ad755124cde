/// A single client command line, recognized by verb.
///
/// Recognition is deliberately shallow: MAIL/RCPT and the trust
/// commands keep their raw line so that the session layer can apply
/// its sequence gates before spending effort on full argument
/// parsing (a malformed MAIL before EHLO is a 503, not a 501).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo { hostname: Option<String> },
    Ehlo { hostname: Option<String> },
    Lhlo { hostname: Option<String> },
    Mail { line: String },
    Rcpt { line: String },
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Help,
    StartTls,
    Auth { args: Vec<String> },
    XClient { line: String },
    XForward { line: String },
    /// An HTTP request verb aimed at the SMTP port.
    Http { verb: String },
    /// An empty line.
    Empty,
    Unknown { verb: String },
}

const HTTP_VERBS: &[&str] = &["GET", "POST", "PUT", "HEAD", "OPTIONS", "CONNECT", "DELETE"];

impl Command {
    /// Recognize a command line. Never fails: anything unrecognized
    /// comes back as `Unknown` and the caller decides what that costs.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }

        let (verb, rest) = match trimmed.split_once(|c: char| c.is_ascii_whitespace()) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (trimmed, ""),
        };

        // MAIL FROM:<a> is commonly sent without a space after the verb
        let verb = verb.split_once(':').map(|(v, _)| v).unwrap_or(verb);

        let arg = || {
            if rest.is_empty() {
                None
            } else {
                Some(rest.to_string())
            }
        };

        if verb.eq_ignore_ascii_case("HELO") {
            Self::Helo { hostname: arg() }
        } else if verb.eq_ignore_ascii_case("EHLO") {
            Self::Ehlo { hostname: arg() }
        } else if verb.eq_ignore_ascii_case("LHLO") {
            Self::Lhlo { hostname: arg() }
        } else if verb.eq_ignore_ascii_case("MAIL") {
            Self::Mail {
                line: trimmed.to_string(),
            }
        } else if verb.eq_ignore_ascii_case("RCPT") {
            Self::Rcpt {
                line: trimmed.to_string(),
            }
        } else if verb.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if verb.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if verb.eq_ignore_ascii_case("NOOP") {
            Self::Noop
        } else if verb.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if verb.eq_ignore_ascii_case("VRFY") {
            Self::Vrfy
        } else if verb.eq_ignore_ascii_case("HELP") {
            Self::Help
        } else if verb.eq_ignore_ascii_case("STARTTLS") {
            Self::StartTls
        } else if verb.eq_ignore_ascii_case("AUTH") {
            Self::Auth {
                args: rest.split_ascii_whitespace().map(String::from).collect(),
            }
        } else if verb.eq_ignore_ascii_case("XCLIENT") {
            Self::XClient {
                line: rest.to_string(),
            }
        } else if verb.eq_ignore_ascii_case("XFORWARD") {
            Self::XForward {
                line: rest.to_string(),
            }
        } else if HTTP_VERBS.iter().any(|v| verb.eq_ignore_ascii_case(v)) {
            Self::Http {
                verb: verb.to_ascii_uppercase(),
            }
        } else {
            Self::Unknown {
                verb: verb.to_ascii_uppercase(),
            }
        }
    }

    /// The canonical verb name, as used by `disabled_commands` matching.
    pub fn verb(&self) -> &str {
        match self {
            Self::Helo { .. } => "HELO",
            Self::Ehlo { .. } => "EHLO",
            Self::Lhlo { .. } => "LHLO",
            Self::Mail { .. } => "MAIL",
            Self::Rcpt { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::Vrfy => "VRFY",
            Self::Help => "HELP",
            Self::StartTls => "STARTTLS",
            Self::Auth { .. } => "AUTH",
            Self::XClient { .. } => "XCLIENT",
            Self::XForward { .. } => "XFORWARD",
            Self::Http { verb } | Self::Unknown { verb } => verb,
            Self::Empty => "",
        }
    }
}
