/// RFC 3463 enhanced status code, e.g. `2.1.5`. Attached to a
/// [`Response`] when the session advertises ENHANCEDSTATUSCODES.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedStatusCode {
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }
}

impl std::fmt::Display for EnhancedStatusCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// An SMTP reply: a three-digit code, an optional enhanced status
/// code and one or more lines of text.
///
/// Rendering follows RFC 5321 multi-line framing: every line but the
/// last is `CODE-text`, the last is `CODE text`. When an enhanced
/// status code is present it is repeated on every line, per RFC 2034.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub text: String,
}

impl Response {
    pub fn new<S: Into<String>>(code: u16, text: S) -> Self {
        Self {
            code,
            enhanced_code: None,
            text: text.into(),
        }
    }

    /// Build a multi-line response from explicit lines.
    pub fn lines<S: AsRef<str>>(code: u16, lines: &[S]) -> Self {
        Self {
            code,
            enhanced_code: None,
            text: lines
                .iter()
                .map(|l| l.as_ref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn with_enhanced_code(mut self, enhanced: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(enhanced);
        self
    }

    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// Render to wire form, CRLF terminated.
    pub fn render(&self) -> String {
        let code = self.code;
        let prefix = match &self.enhanced_code {
            Some(enhanced) => format!("{enhanced} "),
            None => String::new(),
        };
        let mut out = String::new();
        let mut lines = self.text.lines().peekable();
        if lines.peek().is_none() {
            return format!("{code}\r\n");
        }
        while let Some(line) = lines.next() {
            let sep = if lines.peek().is_none() { ' ' } else { '-' };
            out.push_str(&format!("{code}{sep}{prefix}{line}\r\n"));
        }
        out
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let first = self.text.lines().next().unwrap_or("");
        match &self.enhanced_code {
            Some(enhanced) => write!(fmt, "{} {enhanced} {first}", self.code),
            None => write!(fmt, "{} {first}", self.code),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_line() {
        assert_eq!(Response::new(250, "Accepted").render(), "250 Accepted\r\n");
    }

    #[test]
    fn multi_line_framing() {
        let resp = Response::lines(250, &["mx.example.com", "PIPELINING", "8BITMIME"]);
        assert_eq!(
            resp.render(),
            "250-mx.example.com\r\n250-PIPELINING\r\n250 8BITMIME\r\n"
        );
    }

    #[test]
    fn empty_text() {
        assert_eq!(Response::new(250, "").render(), "250\r\n");
    }

    #[test]
    fn enhanced_code_on_every_line() {
        let resp = Response::new(250, "Accepted")
            .with_enhanced_code(EnhancedStatusCode::new(2, 1, 5));
        assert_eq!(resp.render(), "250 2.1.5 Accepted\r\n");

        let resp = Response::lines(550, &["mailbox unavailable", "try later"])
            .with_enhanced_code(EnhancedStatusCode::new(5, 1, 1));
        assert_eq!(
            resp.render(),
            "550-5.1.1 mailbox unavailable\r\n550 5.1.1 try later\r\n"
        );
    }

    #[test]
    fn display_includes_enhanced_code() {
        let resp = Response::new(550, "no").with_enhanced_code(EnhancedStatusCode::new(5, 7, 1));
        assert_eq!(resp.to_string(), "550 5.7.1 no");
    }
}
