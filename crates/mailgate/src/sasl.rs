use crate::config::Mechanism;
use crate::handler::{AuthRequest, CramMd5Validation};
use data_encoding::BASE64;
use smtp_proto::Response;
use std::time::{SystemTime, UNIX_EPOCH};

/// Where a SASL exchange stands while the session routes lines to it
/// instead of the command table.
#[derive(Debug, Clone)]
pub(crate) enum SaslState {
    /// Awaiting the PLAIN token.
    PlainToken,
    /// Awaiting the LOGIN username.
    LoginUser,
    /// Awaiting the LOGIN password.
    LoginPassword { username: String },
    /// Awaiting the XOAUTH2 token.
    XOAuthToken,
    /// XOAUTH2 failed; the error status went out in a 334 and the
    /// client owes us one more line (conventionally `*`) before the
    /// final rejection.
    XOAuthFailed { response: Response },
    /// Awaiting the CRAM-MD5 digest for the challenge we issued.
    CramResponse { challenge: String },
}

/// What the session should do next with an exchange.
#[derive(Debug)]
pub(crate) enum SaslStep {
    /// Send the 334 and route the next line back here.
    Challenge(Response, SaslState),
    /// Material complete: ask the host's `on_auth`.
    Authenticate(AuthRequest),
    /// The exchange died on its own; send this and return to command
    /// dispatch.
    Respond(Response),
}

fn bad_base64() -> SaslStep {
    SaslStep::Respond(Response::new(500, "Error: invalid base64 data"))
}

fn aborted() -> SaslStep {
    SaslStep::Respond(Response::new(501, "Error: authentication aborted"))
}

const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// Open an exchange for `mechanism`, honoring any initial response
/// carried on the AUTH line itself.
pub(crate) fn start(
    mechanism: Mechanism,
    initial: Option<&str>,
    server_name: &str,
) -> SaslStep {
    match mechanism {
        Mechanism::Plain => match initial {
            Some(token) => plain_token(token),
            None => SaslStep::Challenge(Response::new(334, ""), SaslState::PlainToken),
        },
        Mechanism::Login => match initial {
            Some(token) => login_username(token),
            None => SaslStep::Challenge(
                Response::new(334, USERNAME_PROMPT),
                SaslState::LoginUser,
            ),
        },
        Mechanism::XOAuth2 => match initial {
            Some(token) => xoauth_token(token),
            None => SaslStep::Challenge(Response::new(334, ""), SaslState::XOAuthToken),
        },
        Mechanism::CramMd5 => {
            if initial.is_some() {
                return SaslStep::Respond(Response::new(
                    501,
                    "Error: CRAM-MD5 does not allow an initial response",
                ));
            }
            let challenge = new_cram_challenge(server_name);
            SaslStep::Challenge(
                Response::new(334, BASE64.encode(challenge.as_bytes())),
                SaslState::CramResponse { challenge },
            )
        }
        Mechanism::XClient => SaslStep::Respond(Response::new(
            504,
            "Error: Unrecognized authentication type",
        )),
    }
}

/// Feed the next client line into an open exchange.
pub(crate) fn advance(state: SaslState, line: &str) -> SaslStep {
    if let SaslState::XOAuthFailed { response } = state {
        return SaslStep::Respond(response);
    }
    if line.trim() == "*" {
        return aborted();
    }
    match state {
        SaslState::PlainToken => plain_token(line),
        SaslState::LoginUser => login_username(line),
        SaslState::LoginPassword { username } => login_password(username, line),
        SaslState::XOAuthToken => xoauth_token(line),
        SaslState::CramResponse { challenge } => cram_response(challenge, line),
        SaslState::XOAuthFailed { .. } => unreachable!("handled above"),
    }
}

fn decode_utf8(token: &str) -> Option<String> {
    let bytes = BASE64.decode(token.trim().as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

fn plain_token(token: &str) -> SaslStep {
    let decoded = match BASE64.decode(token.trim().as_bytes()) {
        Ok(decoded) => decoded,
        Err(_) => return bad_base64(),
    };
    let parts: Vec<&[u8]> = decoded.split(|b| *b == 0).collect();
    if parts.len() != 3 {
        return SaslStep::Respond(Response::new(500, "Error: invalid PLAIN credentials"));
    }
    let field = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();
    SaslStep::Authenticate(AuthRequest {
        mechanism: Mechanism::Plain,
        // parts[0] is the authorization identity, which we ignore the
        // same way most servers do
        username: Some(field(parts[1])),
        password: Some(field(parts[2])),
        access_token: None,
        cram: None,
    })
}

fn login_username(token: &str) -> SaslStep {
    match decode_utf8(token) {
        Some(username) => SaslStep::Challenge(
            Response::new(334, PASSWORD_PROMPT),
            SaslState::LoginPassword { username },
        ),
        None => bad_base64(),
    }
}

fn login_password(username: String, token: &str) -> SaslStep {
    match decode_utf8(token) {
        Some(password) => SaslStep::Authenticate(AuthRequest {
            mechanism: Mechanism::Login,
            username: Some(username),
            password: Some(password),
            access_token: None,
            cram: None,
        }),
        None => bad_base64(),
    }
}

fn xoauth_token(token: &str) -> SaslStep {
    let decoded = match decode_utf8(token) {
        Some(decoded) => decoded,
        None => return bad_base64(),
    };
    let mut username = None;
    let mut access_token = None;
    for part in decoded.split('\u{1}') {
        if let Some(user) = part.strip_prefix("user=") {
            username = Some(user.to_string());
        } else if let Some(auth) = part.strip_prefix("auth=") {
            access_token = auth.strip_prefix("Bearer ").map(String::from);
        }
    }
    match (username, access_token) {
        (Some(username), Some(access_token)) => SaslStep::Authenticate(AuthRequest {
            mechanism: Mechanism::XOAuth2,
            username: Some(username),
            password: None,
            access_token: Some(access_token),
            cram: None,
        }),
        _ => SaslStep::Respond(Response::new(500, "Error: invalid XOAUTH2 token")),
    }
}

fn cram_response(challenge: String, line: &str) -> SaslStep {
    let decoded = match decode_utf8(line) {
        Some(decoded) => decoded,
        None => return bad_base64(),
    };
    let Some((username, digest)) = decoded.rsplit_once(' ') else {
        return SaslStep::Respond(Response::new(500, "Error: invalid CRAM-MD5 response"));
    };
    SaslStep::Authenticate(AuthRequest {
        mechanism: Mechanism::CramMd5,
        username: Some(username.to_string()),
        password: None,
        access_token: None,
        cram: Some(CramMd5Validation {
            challenge,
            response_digest: digest.to_string(),
        }),
    })
}

/// XOAUTH2 failures are reported to the client as a base64 JSON
/// status in a 334, with the real rejection deferred one line.
pub(crate) fn xoauth_failure(rejection: Response) -> (Response, SaslState) {
    let status = format!(
        "{{\"status\":\"{}\",\"schemes\":\"bearer\",\"scope\":\"\"}}",
        rejection.code
    );
    (
        Response::new(334, BASE64.encode(status.as_bytes())),
        SaslState::XOAuthFailed {
            response: rejection,
        },
    )
}

fn new_cram_challenge(server_name: &str) -> String {
    let tag: u32 = rand::random();
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("<{tag}.{stamp}@{server_name}>")
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn plain_initial_response() {
        // \0test\0 1234
        let step = start(Mechanism::Plain, Some("AHRlc3QAMTIzNA=="), "mx");
        match step {
            SaslStep::Authenticate(req) => {
                assert_equal!(req.username.as_deref(), Some("test"));
                assert_equal!(req.password.as_deref(), Some("1234"));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn plain_rejects_bad_split() {
        let token = BASE64.encode(b"only-one-part");
        match plain_token(&token) {
            SaslStep::Respond(resp) => {
                assert_equal!(resp.code, 500);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn login_flow() {
        let step = start(Mechanism::Login, None, "mx");
        let state = match step {
            SaslStep::Challenge(resp, state) => {
                assert_equal!(resp.text, USERNAME_PROMPT);
                state
            }
            other => panic!("unexpected step {other:?}"),
        };
        let state = match advance(state, &BASE64.encode(b"alice")) {
            SaslStep::Challenge(resp, state) => {
                assert_equal!(resp.text, PASSWORD_PROMPT);
                state
            }
            other => panic!("unexpected step {other:?}"),
        };
        match advance(state, &BASE64.encode(b"secret")) {
            SaslStep::Authenticate(req) => {
                assert_equal!(req.username.as_deref(), Some("alice"));
                assert_equal!(req.password.as_deref(), Some("secret"));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn star_aborts() {
        match advance(SaslState::LoginUser, "*") {
            SaslStep::Respond(resp) => {
                assert_equal!(resp.code, 501);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn xoauth_token_parsing() {
        let token = BASE64.encode(b"user=someone@example.com\x01auth=Bearer tok123\x01\x01");
        match xoauth_token(&token) {
            SaslStep::Authenticate(req) => {
                assert_equal!(req.username.as_deref(), Some("someone@example.com"));
                assert_equal!(req.access_token.as_deref(), Some("tok123"));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn xoauth_failure_defers_rejection() {
        let (challenge, state) = xoauth_failure(Response::new(535, "Error: nope"));
        assert_equal!(challenge.code, 334);
        match advance(state, "*") {
            SaslStep::Respond(resp) => {
                assert_equal!(resp.code, 535);
                assert_equal!(resp.text, "Error: nope");
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn cram_challenge_shape() {
        let challenge = new_cram_challenge("mx.example.com");
        assert!(challenge.starts_with('<'));
        assert!(challenge.ends_with("@mx.example.com>"));
    }
}
