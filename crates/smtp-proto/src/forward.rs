use crate::ProtoError;

/// One `KEY=VALUE` attribute from an XCLIENT or XFORWARD command.
/// `[UNAVAILABLE]` and `[TEMPUNAVAIL]` collapse to a `None` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub key: String,
    pub value: Option<String>,
}

/// Parse the attribute list of an XCLIENT/XFORWARD command, checking
/// each key against the set the command supports.
pub fn parse_attributes(line: &str, allowed: &[&str]) -> Result<Vec<Attribute>, ProtoError> {
    let mut attrs = Vec::new();
    for token in line.split_ascii_whitespace() {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| ProtoError::Syntax(format!("Error: Invalid parameter {token}")))?;
        let key = key.to_ascii_uppercase();
        if !allowed.iter().any(|a| *a == key) {
            return Err(ProtoError::UnknownParameter(key));
        }
        let value = if value.is_empty()
            || value.eq_ignore_ascii_case("[UNAVAILABLE]")
            || value.eq_ignore_ascii_case("[TEMPUNAVAIL]")
        {
            None
        } else {
            Some(value.to_string())
        };
        attrs.push(Attribute { key, value });
    }
    if attrs.is_empty() {
        return Err(ProtoError::Syntax(
            "Error: bad command parameter syntax".to_string(),
        ));
    }
    Ok(attrs)
}

#[cfg(test)]
mod test {
    use super::*;

    const XCLIENT_KEYS: &[&str] = &["NAME", "ADDR", "PORT", "PROTO", "HELO", "LOGIN"];

    #[test]
    fn parses_pairs() {
        let attrs = parse_attributes("ADDR=192.0.2.1 NAME=foo.example", XCLIENT_KEYS).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].key, "ADDR");
        assert_eq!(attrs[0].value.as_deref(), Some("192.0.2.1"));
        assert_eq!(attrs[1].key, "NAME");
    }

    #[test]
    fn unavailable_is_none() {
        let attrs = parse_attributes("NAME=[UNAVAILABLE] ADDR=[TempUnavail]", XCLIENT_KEYS).unwrap();
        assert_eq!(attrs[0].value, None);
        assert_eq!(attrs[1].value, None);
    }

    #[test]
    fn rejects_unknown_keys_and_bare_words() {
        assert!(parse_attributes("WAT=1", XCLIENT_KEYS).is_err());
        assert!(parse_attributes("ADDR", XCLIENT_KEYS).is_err());
        assert!(parse_attributes("", XCLIENT_KEYS).is_err());
    }
}
