//! Byte-stream framing for the SMTP session: a single sink that
//! toggles between command mode (line splitting) and data mode
//! (dot-unstuffing plus `<CRLF>.<CRLF>` terminator detection).
//!
//! The parser is sans-io: callers push chunks with [`FrameParser::feed`]
//! and pull whatever the current mode produces. Back-pressure falls out
//! of the pull model, since nothing is tokenized until asked for.

mod body;
mod parser;

pub use body::{body_channel, BodySender, BodyStream};
pub use parser::{DataProgress, FrameParser};
