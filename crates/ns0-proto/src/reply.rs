//! Reply formatting and parsing.
//!
//! A reply is one or more lines, each `NNN-text` (continuation) or
//! `NNN text` (final). The code repeats on every line of a multi-line
//! reply.

use crate::{ProtoError, Result};

/// One parsed reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    pub text: String,
    /// `NNN text` rather than `NNN-text`.
    pub is_final: bool,
}

/// A complete reply: one code, all text lines in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// The full body joined with newlines.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Format a reply body (possibly multi-line) into wire lines.
///
/// Embedded newlines in `text` become continuation lines; the last line
/// carries the `NNN<SP>` terminator.
pub fn format_reply(code: u16, text: &str) -> String {
    let mut out = String::new();
    let mut lines = text.split('\n').peekable();
    while let Some(line) = lines.next() {
        let sep = if lines.peek().is_some() { '-' } else { ' ' };
        out.push_str(&format!("{code:03}{sep}{line}\n"));
    }
    out
}

/// Parse one wire line (without its trailing newline).
pub fn parse_reply_line(line: &str) -> Result<ReplyLine> {
    let bad = || ProtoError::BadReply(line.to_owned());
    if line.len() < 4 {
        return Err(bad());
    }
    let (code_s, rest) = line.split_at_checked(3).ok_or_else(bad)?;
    let code: u16 = code_s.parse().map_err(|_| bad())?;
    if !(100..1000).contains(&code) {
        return Err(bad());
    }
    let mut chars = rest.chars();
    let sep = chars.next().ok_or_else(bad)?;
    let is_final = match sep {
        ' ' => true,
        '-' => false,
        _ => return Err(bad()),
    };
    Ok(ReplyLine {
        code,
        text: chars.as_str().to_owned(),
        is_final,
    })
}
