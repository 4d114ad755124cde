use crate::ProtoError;
use std::collections::BTreeMap;

/// Value side of an ESMTP parameter: either a bare flag (`SMTPUTF8`)
/// or a key=value pair (`SIZE=1024`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Flag,
    Value(String),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Flag => None,
            Self::Value(v) => Some(v),
        }
    }
}

/// Parsed `MAIL FROM` / `RCPT TO` argument: the envelope address plus
/// any extension parameters that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCommand {
    pub address: String,
    pub args: BTreeMap<String, ParamValue>,
}

pub fn parse_mail_from(line: &str) -> Result<PathCommand, ProtoError> {
    parse_path(line, "MAIL FROM", true)
}

pub fn parse_rcpt_to(line: &str) -> Result<PathCommand, ProtoError> {
    parse_path(line, "RCPT TO", false)
}

fn parse_path(line: &str, verb: &str, allow_null: bool) -> Result<PathCommand, ProtoError> {
    let (prefix, rest) = line
        .split_once(':')
        .ok_or_else(|| ProtoError::Syntax(format!("Error: command syntax, expected {verb}:")))?;

    // "MAIL  FROM" with stray whitespace is tolerated
    let normalized: String = prefix.split_ascii_whitespace().collect::<Vec<_>>().join(" ");
    if !normalized.eq_ignore_ascii_case(verb) {
        return Err(ProtoError::Syntax(format!(
            "Error: command syntax, expected {verb}:"
        )));
    }

    let mut tokens = rest.split_ascii_whitespace();
    let addr_token = tokens
        .next()
        .ok_or_else(|| ProtoError::Syntax("Error: missing address".to_string()))?;

    if !addr_token.starts_with('<') || !addr_token.ends_with('>') {
        return Err(ProtoError::Syntax(
            "Error: address must be enclosed in angle brackets".to_string(),
        ));
    }
    let raw_addr = &addr_token[1..addr_token.len() - 1];
    if raw_addr.is_empty() && !allow_null {
        return Err(ProtoError::Syntax(
            "Error: null path not allowed here".to_string(),
        ));
    }

    let mut args = BTreeMap::new();
    for token in tokens {
        match token.split_once('=') {
            Some((key, value)) => {
                args.insert(key.to_ascii_uppercase(), ParamValue::Value(xtext_decode(value)));
            }
            None => {
                args.insert(token.to_ascii_uppercase(), ParamValue::Flag);
            }
        }
    }

    Ok(PathCommand {
        address: decode_idn(raw_addr),
        args,
    })
}

/// Decode the domain half of an address from punycode to Unicode.
/// A failed decode keeps the ASCII form; the peer's label soup is not
/// our problem to reject at this layer.
fn decode_idn(address: &str) -> String {
    match address.rsplit_once('@') {
        Some((local, domain)) if !domain.is_empty() => {
            let (unicode, result) = idna::domain_to_unicode(domain);
            match result {
                Ok(()) => format!("{local}@{unicode}"),
                Err(err) => {
                    tracing::debug!("failed to IDN-decode domain {domain}: {err:?}");
                    address.to_string()
                }
            }
        }
        _ => address.to_string(),
    }
}

/// Decode RFC 3461 xtext: every `+HH` hex pair becomes the raw byte,
/// everything else passes through.
pub fn xtext_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'+' {
            let pair = bytes.get(i + 1..i + 3);
            if let Some(hex) = pair.and_then(|p| std::str::from_utf8(p).ok()) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn plain_mail_from() {
        let parsed = parse_mail_from("MAIL FROM:<andris@kreata.ee>").unwrap();
        assert_equal!(parsed.address, "andris@kreata.ee");
        assert!(parsed.args.is_empty());
    }

    #[test]
    fn null_sender() {
        let parsed = parse_mail_from("MAIL FROM:<>").unwrap();
        assert_equal!(parsed.address, "");

        let err = parse_rcpt_to("RCPT TO:<>").unwrap_err();
        assert_equal!(err.response_code(), 501);
    }

    #[test]
    fn verb_mismatch() {
        assert!(parse_mail_from("RCPT TO:<a@b>").is_err());
        assert!(parse_mail_from("MAIL BLAH:<a@b>").is_err());
        // tolerated whitespace around the verb
        assert!(parse_mail_from("mail   from:<a@b>").is_ok());
    }

    #[test]
    fn params_are_uppercased_and_split() {
        let parsed = parse_mail_from("MAIL FROM:<a@b> size=100 smtputf8 Ret=hdrs").unwrap();
        assert_equal!(
            parsed.args.get("SIZE"),
            Some(&ParamValue::Value("100".to_string()))
        );
        assert_equal!(parsed.args.get("SMTPUTF8"), Some(&ParamValue::Flag));
        assert_equal!(
            parsed.args.get("RET"),
            Some(&ParamValue::Value("hdrs".to_string()))
        );
    }

    #[test]
    fn xtext_values() {
        assert_equal!(xtext_decode("abc"), "abc");
        assert_equal!(xtext_decode("a+20b"), "a b");
        assert_equal!(xtext_decode("+2B"), "+");
        // incomplete escape passes through
        assert_equal!(xtext_decode("a+2"), "a+2");
        assert_equal!(xtext_decode("a+zz"), "a+zz");

        let parsed = parse_rcpt_to("RCPT TO:<a@b> ORCPT=rfc822;foo+40example.org").unwrap();
        assert_equal!(
            parsed.args.get("ORCPT"),
            Some(&ParamValue::Value("rfc822;foo@example.org".to_string()))
        );
    }

    #[test]
    fn idn_domains() {
        let parsed = parse_mail_from("MAIL FROM:<a@xn--maana-pta.com>").unwrap();
        assert_equal!(parsed.address, "a@mañana.com");

        // broken punycode keeps the ascii form
        let parsed = parse_mail_from("MAIL FROM:<a@xn---->").unwrap();
        assert_equal!(parsed.address, "a@xn----");
    }

    #[test]
    fn missing_brackets() {
        assert!(parse_mail_from("MAIL FROM:a@b").is_err());
        assert!(parse_mail_from("MAIL FROM:").is_err());
    }
}
