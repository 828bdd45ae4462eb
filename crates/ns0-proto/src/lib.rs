//! Line-oriented RPC wire grammar for the ns0 master/slave channel.
//!
//! The master process drives each slave through a synchronous, text-based
//! protocol over an ordered byte stream (a `socketpair` in practice). One
//! command per line; replies are one or more status lines.
//!
//! ## Command grammar
//!
//! ```text
//! CMD [SUB] arg*\n
//! ```
//!
//! Arguments are whitespace-separated tokens. Any argument that is empty,
//! or contains a byte ≤ space, above `z`, or an `=` sign, travels as
//! `=<base64>`; everything else travels raw. Integers are decimal.
//!
//! | Command | Mandatory | Optional / variadic |
//! |-----------|--------------------|---------------------|
//! | QUIT      | –                  | –                   |
//! | HELP      | –                  | –                   |
//! | X11 SET   | protoname, hexkey  | –                   |
//! | X11 SOCK  | –                  | –                   |
//! | IF LIST   | –                  | ifnr                |
//! | IF SET    | ifnr, attr, value  | attr/value pairs    |
//! | IF RTRN   | ifnr, pid          | –                   |
//! | IF DEL    | ifnr               | –                   |
//! | ADDR LIST | –                  | ifnr                |
//! | ADDR ADD  | ifnr, addr, plen   | broadcast           |
//! | ADDR DEL  | ifnr, addr, plen   | –                   |
//! | ROUT LIST | –                  | –                   |
//! | ROUT ADD  | type, prefix, plen, nexthop, ifnr, metric | – |
//! | ROUT DEL  | type, prefix, plen, nexthop, ifnr, metric | – |
//! | PROC CRTE | executable         | argv…               |
//! | PROC POLL | pid                | –                   |
//! | PROC WAIT | pid                | –                   |
//! | PROC KILL | pid                | signal              |
//!
//! `PROC CRTE` switches the session into *proc-build* mode, where only
//! `PROC USER|CWD|ENV|SIN|SOUT|SERR|RUN|ABRT`, `QUIT` and `HELP` are
//! legal; `RUN`, `ABRT` and any handler error switch back.
//!
//! ## Reply grammar
//!
//! ```text
//! NNN-continuation line\n
//! NNN final line\n
//! ```
//!
//! Classes: 2xx success (200 generic, 220 greeting, 221 goodbye), 3xx more
//! input expected (354 send an FD now), 4xx transient (450 not finished
//! yet), 5xx permanent (500 protocol error, 550 marshalled remote error).
//!
//! The 550 body is `#`-comment lines followed by base64 of a JSON-encoded
//! [`RemoteError`], which the client maps back into a native error.

mod command;
mod escape;
mod remote;
mod reply;

pub use command::{Arg, CommandDef, Mode, ParsedCommand, TABLE, help_text, lookup, parse_command};
pub use escape::{escape_arg, needs_escape, unescape_arg};
pub use remote::{RemoteError, RemoteErrorKind};
pub use reply::{Reply, ReplyLine, format_reply, parse_reply_line};

/// Protocol-level failure: malformed commands, replies, or payloads.
///
/// On the server side these all map onto a 500 reply.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtoError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("unknown sub-command: {0} {1}")]
    UnknownSubCommand(String, String),
    #[error("missing sub-command for {0}")]
    MissingSubCommand(String),
    #[error("wrong number of arguments for {0}")]
    BadArity(String),
    #[error("invalid integer argument: {0}")]
    BadInt(String),
    #[error("invalid base64 argument: {0}")]
    BadBase64(String),
    #[error("malformed reply line: {0}")]
    BadReply(String),
    #[error("malformed remote error payload: {0}")]
    BadRemoteError(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;

// Reply codes. Kept as bare constants so formatting sites read like the
// wire traffic they produce.
pub const OK: u16 = 200;
pub const GREETING: u16 = 220;
pub const GOODBYE: u16 = 221;
pub const SEND_FD: u16 = 354;
pub const NOT_FINISHED: u16 = 450;
pub const PROTO_ERROR: u16 = 500;
pub const REMOTE_ERROR: u16 = 550;
