#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Backtick,
    LineComment,
    BlockComment,
}

/// `-- ` only starts a comment in MySQL when the dashes are followed by whitespace or the end
/// of the statement.
pub(super) fn is_dash_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'-')
        && bytes.get(idx + 1) == Some(&b'-')
        && bytes
            .get(idx + 2)
            .is_none_or(|b| b.is_ascii_whitespace() || b.is_ascii_control())
}

pub(super) fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

pub(super) fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

/// Advance past a quoted section starting after the opening `quote`. Handles backslash escapes
/// and doubled quotes. Returns the new index and whether the quote was closed.
pub(super) fn step_quoted(bytes: &[u8], idx: usize, quote: u8, backslash: bool) -> (usize, bool) {
    let b = bytes[idx];
    if backslash && b == b'\\' {
        return (idx + 1, false);
    }
    if b == quote {
        if bytes.get(idx + 1) == Some(&quote) {
            return (idx + 1, false);
        }
        return (idx, true);
    }
    (idx, false)
}
