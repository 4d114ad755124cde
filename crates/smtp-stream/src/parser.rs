/// What a call to [`FrameParser::drain_data`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataProgress {
    /// More body bytes may follow; feed another chunk.
    Reading,
    /// The terminator was seen. The parser holds any trailing bytes
    /// until [`FrameParser::resume`] is called.
    Complete,
}

#[derive(Debug)]
enum Mode {
    Command,
    Data(DataState),
    /// Data terminator seen; the unparsed tail stays buffered until
    /// the caller has finished consuming the body and resumes us.
    Hold { bytes: u64, exceeded: bool },
}

#[derive(Debug)]
struct DataState {
    limit: Option<u64>,
    emitted: u64,
    at_line_start: bool,
    pending: Pending,
}

/// Lookahead held across chunk boundaries while deciding whether a
/// line-leading dot is stuffing or the terminator. Never more than
/// two bytes (`.` or `.\r`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Dot,
    DotCr,
}

/// The two-mode frame parser described in the module docs.
#[derive(Debug)]
pub struct FrameParser {
    buf: Vec<u8>,
    mode: Mode,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            mode: Mode::Command,
        }
    }

    /// Push a chunk of raw socket bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet consumed (excludes held lookahead).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes. Used when the plaintext stream is
    /// abandoned, e.g. on STARTTLS.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.mode = Mode::Command;
    }

    /// In command mode: the next complete line, without its CRLF/LF
    /// terminator. `None` when no full line is buffered.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        if !matches!(self.mode, Mode::Command) {
            return None;
        }
        let nl = memchr::memchr(b'\n', &self.buf)?;
        let mut line: Vec<u8> = self.buf[..nl].to_vec();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        self.buf.drain(..=nl);
        Some(line)
    }

    /// At EOF, any retained partial line is delivered as a final
    /// command with no terminator.
    pub fn take_eof_line(&mut self) -> Option<Vec<u8>> {
        if !matches!(self.mode, Mode::Command) || self.buf.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buf))
    }

    /// Switch to data mode. Bytes already buffered (pipelined after
    /// the DATA line) are treated as body input on the next drain.
    pub fn begin_data(&mut self, limit: Option<u64>) {
        self.mode = Mode::Data(DataState {
            limit,
            emitted: 0,
            at_line_start: true,
            pending: Pending::None,
        });
    }

    /// Process buffered bytes in data mode, appending unstuffed body
    /// bytes to `out`.
    pub fn drain_data(&mut self, out: &mut Vec<u8>) -> DataProgress {
        let state = match &mut self.mode {
            Mode::Data(state) => state,
            Mode::Hold { .. } => return DataProgress::Complete,
            Mode::Command => return DataProgress::Reading,
        };

        let before = out.len();
        let mut i = 0;
        let mut terminated = false;

        while i < self.buf.len() {
            let b = self.buf[i];
            match state.pending {
                Pending::None => {
                    if state.at_line_start && b == b'.' {
                        state.pending = Pending::Dot;
                    } else {
                        out.push(b);
                        state.at_line_start = b == b'\n';
                    }
                    i += 1;
                }
                Pending::Dot => match b {
                    // stuffed dot: two in, one out
                    b'.' => {
                        out.push(b'.');
                        state.pending = Pending::None;
                        state.at_line_start = false;
                        i += 1;
                    }
                    b'\r' => {
                        state.pending = Pending::DotCr;
                        i += 1;
                    }
                    _ => {
                        out.push(b'.');
                        state.pending = Pending::None;
                        state.at_line_start = false;
                        // reprocess b as an ordinary byte
                    }
                },
                Pending::DotCr => {
                    if b == b'\n' {
                        i += 1;
                        terminated = true;
                        break;
                    }
                    out.push(b'.');
                    out.push(b'\r');
                    state.pending = Pending::None;
                    state.at_line_start = false;
                    // reprocess b
                }
            }
        }

        state.emitted += (out.len() - before) as u64;

        if terminated {
            let bytes = state.emitted;
            let exceeded = state.limit.is_some_and(|limit| bytes > limit);
            self.buf.drain(..i);
            self.mode = Mode::Hold { bytes, exceeded };
            DataProgress::Complete
        } else {
            self.buf.clear();
            DataProgress::Reading
        }
    }

    /// Post-unstuff body byte count. Valid in data mode and after
    /// completion.
    pub fn data_bytes(&self) -> u64 {
        match &self.mode {
            Mode::Data(state) => state.emitted,
            Mode::Hold { bytes, .. } => *bytes,
            Mode::Command => 0,
        }
    }

    /// Whether the body overran the byte budget given to
    /// [`FrameParser::begin_data`]. The parser never truncates; the
    /// caller decides what an overrun costs.
    pub fn size_exceeded(&self) -> bool {
        match &self.mode {
            Mode::Data(state) => state.limit.is_some_and(|limit| state.emitted > limit),
            Mode::Hold { exceeded, .. } => *exceeded,
            Mode::Command => false,
        }
    }

    /// Leave the post-data hold and return to command mode. Only then
    /// does the retained tail become visible to `next_line`, which
    /// guarantees the caller observed the whole body before any
    /// pipelined follow-up command.
    pub fn resume(&mut self) {
        if matches!(self.mode, Mode::Hold { .. }) {
            self.mode = Mode::Command;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn lines(parser: &mut FrameParser) -> Vec<String> {
        let mut out = vec![];
        while let Some(line) = parser.next_line() {
            out.push(String::from_utf8(line).unwrap());
        }
        out
    }

    #[test]
    fn splits_lines_on_crlf_and_lf() {
        let mut parser = FrameParser::new();
        parser.feed(b"EHLO foo\r\nNOOP\nQUIT\r\n");
        assert_equal!(lines(&mut parser), vec!["EHLO foo", "NOOP", "QUIT"]);
    }

    #[test]
    fn retains_partial_line_across_chunks() {
        let mut parser = FrameParser::new();
        parser.feed(b"EH");
        assert_equal!(parser.next_line(), None);
        parser.feed(b"LO foo\r\nNO");
        assert_equal!(lines(&mut parser), vec!["EHLO foo"]);
        parser.feed(b"OP\r\n");
        assert_equal!(lines(&mut parser), vec!["NOOP"]);
    }

    #[test]
    fn eof_flushes_remainder() {
        let mut parser = FrameParser::new();
        parser.feed(b"QUI");
        assert_equal!(parser.take_eof_line(), Some(b"QUI".to_vec()));
        assert_equal!(parser.take_eof_line(), None);
    }

    fn run_data(parser: &mut FrameParser, input: &[u8]) -> (Vec<u8>, DataProgress) {
        parser.feed(input);
        let mut body = Vec::new();
        let progress = parser.drain_data(&mut body);
        (body, progress)
    }

    #[test]
    fn simple_body() {
        let mut parser = FrameParser::new();
        parser.begin_data(None);
        let (body, progress) = run_data(&mut parser, b"hi\r\n.\r\nQUIT\r\n");
        assert_equal!(progress, DataProgress::Complete);
        assert_equal!(body, b"hi\r\n".to_vec());
        assert_equal!(parser.data_bytes(), 4);

        // the tail stays invisible until resume
        assert_equal!(parser.next_line(), None);
        parser.resume();
        assert_equal!(parser.next_line(), Some(b"QUIT".to_vec()));
    }

    #[test]
    fn unstuffs_doubled_dots() {
        let mut parser = FrameParser::new();
        parser.begin_data(None);
        let (body, progress) = run_data(&mut parser, b"..bar\r\n.\r\n");
        assert_equal!(progress, DataProgress::Complete);
        assert_equal!(body, b".bar\r\n".to_vec());
    }

    #[test]
    fn single_dot_line_content_is_preserved() {
        // only doubled dots are unstuffed; a lone mid-body dot line
        // that is not the terminator keeps its dot
        let mut parser = FrameParser::new();
        parser.begin_data(None);
        let (body, _) = run_data(&mut parser, b".baz\r\n.\r\n");
        assert_equal!(body, b".baz\r\n".to_vec());
    }

    #[test]
    fn empty_body_terminates_immediately() {
        let mut parser = FrameParser::new();
        parser.begin_data(None);
        let (body, progress) = run_data(&mut parser, b".\r\n");
        assert_equal!(progress, DataProgress::Complete);
        assert_equal!(body, Vec::<u8>::new());
        assert_equal!(parser.data_bytes(), 0);
    }

    #[test]
    fn terminator_split_across_chunks() {
        let mut parser = FrameParser::new();
        parser.begin_data(None);
        let mut body = Vec::new();

        for chunk in [&b"hello\r"[..], b"\n", b".", b"\r", b"\n"] {
            parser.feed(chunk);
            if parser.drain_data(&mut body) == DataProgress::Complete {
                break;
            }
        }
        assert_equal!(body, b"hello\r\n".to_vec());
    }

    #[test]
    fn held_dot_released_when_not_terminator() {
        let mut parser = FrameParser::new();
        parser.begin_data(None);
        let mut body = Vec::new();
        parser.feed(b"a\r\n.");
        parser.drain_data(&mut body);
        parser.feed(b".b\r\n.\r\n");
        let progress = parser.drain_data(&mut body);
        assert_equal!(progress, DataProgress::Complete);
        assert_equal!(body, b"a\r\n.b\r\n".to_vec());
    }

    #[test]
    fn dot_cr_without_lf_is_body() {
        let mut parser = FrameParser::new();
        parser.begin_data(None);
        let (body, progress) = run_data(&mut parser, b".\rx\r\n.\r\n");
        assert_equal!(progress, DataProgress::Complete);
        assert_equal!(body, b".\rx\r\n".to_vec());
    }

    #[test]
    fn size_accounting() {
        let mut parser = FrameParser::new();
        parser.begin_data(Some(5));
        let (body, progress) = run_data(&mut parser, b"123456\r\n.\r\n");
        assert_equal!(progress, DataProgress::Complete);
        assert_equal!(body.len(), 8);
        assert_equal!(parser.data_bytes(), 8);
        assert!(parser.size_exceeded());

        let mut parser = FrameParser::new();
        parser.begin_data(Some(8));
        run_data(&mut parser, b"123456\r\n.\r\n");
        assert!(!parser.size_exceeded());
    }

    #[test]
    fn pipelined_data_after_command() {
        // body bytes already buffered when DATA is dispatched
        let mut parser = FrameParser::new();
        parser.feed(b"DATA\r\nbody\r\n.\r\nRSET\r\n");
        assert_equal!(parser.next_line(), Some(b"DATA".to_vec()));
        parser.begin_data(None);
        let mut body = Vec::new();
        assert_equal!(parser.drain_data(&mut body), DataProgress::Complete);
        assert_equal!(body, b"body\r\n".to_vec());
        parser.resume();
        assert_equal!(parser.next_line(), Some(b"RSET".to_vec()));
    }
}
