//! Command table and line parser.
//!
//! The table is data: one entry per `CMD [SUB]` pair with a typed argument
//! signature and the session mode it is legal in. The parser tokenises one
//! line, resolves the entry, checks arity, and decodes each token
//! according to its declared type.
//!
//! Signature characters: `i` decimal integer, `b` escaped byte string,
//! `s` plain token (kept as received, unescaped).

use crate::escape::unescape_arg;
use crate::{ProtoError, Result};

/// Session mode an entry is legal in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Normal dispatch.
    Base,
    /// Between `PROC CRTE` and `PROC RUN`/`PROC ABRT`.
    Build,
    /// Legal in both modes (`QUIT`, `HELP`).
    Any,
}

/// One entry of the command table.
#[derive(Debug, Clone, Copy)]
pub struct CommandDef {
    pub name: &'static str,
    pub sub: Option<&'static str>,
    /// Mandatory argument signature.
    pub required: &'static str,
    /// Optional trailing arguments, consumed in order.
    pub optional: &'static str,
    /// Type of arbitrarily repeated trailing arguments.
    pub variadic: Option<char>,
    pub mode: Mode,
}

impl CommandDef {
    /// `"IF SET"`, `"QUIT"`, … as written on the wire.
    pub fn full_name(&self) -> String {
        match self.sub {
            Some(sub) => format!("{} {}", self.name, sub),
            None => self.name.to_owned(),
        }
    }
}

pub static TABLE: &[CommandDef] = &[
    cmd("QUIT", None, "", "", None, Mode::Any),
    cmd("HELP", None, "", "", None, Mode::Any),
    cmd("X11", Some("SET"), "sb", "", None, Mode::Base),
    cmd("X11", Some("SOCK"), "", "", None, Mode::Base),
    cmd("IF", Some("LIST"), "", "i", None, Mode::Base),
    cmd("IF", Some("SET"), "isb", "", Some('b'), Mode::Base),
    cmd("IF", Some("RTRN"), "ii", "", None, Mode::Base),
    cmd("IF", Some("DEL"), "i", "", None, Mode::Base),
    cmd("ADDR", Some("LIST"), "", "i", None, Mode::Base),
    cmd("ADDR", Some("ADD"), "ibi", "b", None, Mode::Base),
    cmd("ADDR", Some("DEL"), "ibi", "", None, Mode::Base),
    cmd("ROUT", Some("LIST"), "", "", None, Mode::Base),
    cmd("ROUT", Some("ADD"), "sbibii", "", None, Mode::Base),
    cmd("ROUT", Some("DEL"), "sbibii", "", None, Mode::Base),
    cmd("PROC", Some("CRTE"), "b", "", Some('b'), Mode::Base),
    cmd("PROC", Some("POLL"), "i", "", None, Mode::Base),
    cmd("PROC", Some("WAIT"), "i", "", None, Mode::Base),
    cmd("PROC", Some("KILL"), "i", "i", None, Mode::Base),
    cmd("PROC", Some("USER"), "b", "", None, Mode::Build),
    cmd("PROC", Some("CWD"), "b", "", None, Mode::Build),
    cmd("PROC", Some("ENV"), "bb", "", Some('b'), Mode::Build),
    cmd("PROC", Some("SIN"), "", "", None, Mode::Build),
    cmd("PROC", Some("SOUT"), "", "", None, Mode::Build),
    cmd("PROC", Some("SERR"), "", "", None, Mode::Build),
    cmd("PROC", Some("RUN"), "", "", None, Mode::Build),
    cmd("PROC", Some("ABRT"), "", "", None, Mode::Build),
];

const fn cmd(
    name: &'static str,
    sub: Option<&'static str>,
    required: &'static str,
    optional: &'static str,
    variadic: Option<char>,
    mode: Mode,
) -> CommandDef {
    CommandDef {
        name,
        sub,
        required,
        optional,
        variadic,
        mode,
    }
}

/// One decoded argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Int(i64),
    Bytes(Vec<u8>),
}

impl Arg {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(n) => Some(*n),
            Arg::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Arg::Bytes(b) => Some(b),
            Arg::Int(_) => None,
        }
    }
}

/// A fully validated command line.
#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub def: &'static CommandDef,
    pub args: Vec<Arg>,
}

/// Look up a table entry by name and optional sub-command.
pub fn lookup(name: &str, sub: Option<&str>) -> Option<&'static CommandDef> {
    TABLE
        .iter()
        .find(|d| d.name == name && d.sub == sub.map(str::to_uppercase).as_deref())
}

fn has_subcommands(name: &str) -> bool {
    TABLE.iter().any(|d| d.name == name && d.sub.is_some())
}

fn known_command(name: &str) -> bool {
    TABLE.iter().any(|d| d.name == name)
}

fn decode_one(ty: char, token: &str) -> Result<Arg> {
    match ty {
        'i' => {
            let raw = unescape_arg(token)?;
            let s =
                std::str::from_utf8(&raw).map_err(|_| ProtoError::BadInt(token.to_owned()))?;
            s.parse::<i64>()
                .map(Arg::Int)
                .map_err(|_| ProtoError::BadInt(token.to_owned()))
        }
        'b' => Ok(Arg::Bytes(unescape_arg(token)?)),
        // 's': plain token, passed through verbatim
        _ => Ok(Arg::Bytes(token.as_bytes().to_vec())),
    }
}

/// Parse and validate one command line (no trailing newline).
pub fn parse_command(line: &str) -> Result<ParsedCommand> {
    let mut tokens = line.split_ascii_whitespace();
    let name = tokens.next().ok_or(ProtoError::EmptyCommand)?.to_uppercase();
    if !known_command(&name) {
        return Err(ProtoError::UnknownCommand(name));
    }

    let mut rest: Vec<&str> = tokens.collect();
    let def = if has_subcommands(&name) {
        if rest.is_empty() {
            return Err(ProtoError::MissingSubCommand(name));
        }
        let sub = rest.remove(0);
        lookup(&name, Some(sub))
            .ok_or_else(|| ProtoError::UnknownSubCommand(name.clone(), sub.to_uppercase()))?
    } else {
        lookup(&name, None).ok_or_else(|| ProtoError::UnknownCommand(name.clone()))?
    };

    let min = def.required.len();
    let max = def
        .variadic
        .is_none()
        .then_some(min + def.optional.len());
    if rest.len() < min || max.is_some_and(|m| rest.len() > m) {
        return Err(ProtoError::BadArity(def.full_name()));
    }

    let types = def
        .required
        .chars()
        .chain(def.optional.chars())
        .chain(std::iter::repeat(def.variadic.unwrap_or('b')));
    let args = rest
        .iter()
        .zip(types)
        .map(|(tok, ty)| decode_one(ty, tok))
        .collect::<Result<Vec<_>>>()?;

    Ok(ParsedCommand { def, args })
}

/// Human-readable command summary for `HELP`.
pub fn help_text() -> String {
    let mut out = String::from("Available commands:");
    for def in TABLE {
        out.push('\n');
        out.push_str(&def.full_name());
        for c in def.required.chars() {
            out.push_str(match c {
                'i' => " <int>",
                's' => " <token>",
                _ => " <data>",
            });
        }
        for c in def.optional.chars() {
            out.push_str(match c {
                'i' => " [int]",
                's' => " [token]",
                _ => " [data]",
            });
        }
        if def.variadic.is_some() {
            out.push_str(" ...");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::escape_arg;

    #[test]
    fn parse_bare_command() {
        let c = parse_command("QUIT").unwrap();
        assert_eq!(c.def.name, "QUIT");
        assert!(c.args.is_empty());
    }

    #[test]
    fn parse_is_case_insensitive() {
        let c = parse_command("quit").unwrap();
        assert_eq!(c.def.name, "QUIT");
        let c = parse_command("if list").unwrap();
        assert_eq!(c.def.full_name(), "IF LIST");
    }

    #[test]
    fn trailing_whitespace_ignored() {
        let c = parse_command("IF LIST   ").unwrap();
        assert_eq!(c.def.full_name(), "IF LIST");
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(matches!(
            parse_command("FROB"),
            Err(ProtoError::UnknownCommand(_))
        ));
    }

    #[test]
    fn unknown_subcommand_rejected() {
        assert!(matches!(
            parse_command("IF FROB"),
            Err(ProtoError::UnknownSubCommand(..))
        ));
    }

    #[test]
    fn missing_subcommand_rejected() {
        assert!(matches!(
            parse_command("IF"),
            Err(ProtoError::MissingSubCommand(_))
        ));
    }

    #[test]
    fn arity_too_short() {
        assert!(matches!(
            parse_command("IF DEL"),
            Err(ProtoError::BadArity(_))
        ));
    }

    #[test]
    fn arity_too_long() {
        assert!(matches!(
            parse_command("IF DEL 1 2"),
            Err(ProtoError::BadArity(_))
        ));
    }

    #[test]
    fn optional_arg_accepted() {
        let c = parse_command("IF LIST 3").unwrap();
        assert_eq!(c.args[0], Arg::Int(3));
        let c = parse_command("IF LIST").unwrap();
        assert!(c.args.is_empty());
    }

    #[test]
    fn int_type_mismatch_rejected() {
        assert!(matches!(
            parse_command("IF DEL abc"),
            Err(ProtoError::BadInt(_))
        ));
    }

    #[test]
    fn escaped_int_accepted() {
        let tok = escape_arg(b"7");
        let c = parse_command(&format!("IF DEL {tok}")).unwrap();
        assert_eq!(c.args[0], Arg::Int(7));
    }

    #[test]
    fn variadic_args_collected() {
        let c = parse_command("PROC CRTE /bin/ls ls -l").unwrap();
        assert_eq!(c.args.len(), 3);
        assert_eq!(c.args[1], Arg::Bytes(b"ls".to_vec()));
    }

    #[test]
    fn escaped_variadic_roundtrip() {
        let arg = escape_arg(b"hello world");
        let c = parse_command(&format!("PROC CRTE /bin/echo echo {arg}")).unwrap();
        assert_eq!(c.args[2], Arg::Bytes(b"hello world".to_vec()));
    }

    #[test]
    fn if_set_requires_one_pair() {
        assert!(parse_command("IF SET 1").is_err());
        assert!(parse_command("IF SET 1 mtu 1500").is_ok());
    }

    #[test]
    fn rout_add_full_signature() {
        let empty = escape_arg(b"");
        let line = format!("ROUT ADD unicast {empty} 0 10.0.0.1 2 0");
        let c = parse_command(&line).unwrap();
        assert_eq!(c.args[0], Arg::Bytes(b"unicast".to_vec()));
        assert_eq!(c.args[1], Arg::Bytes(Vec::new()));
        assert_eq!(c.args[2], Arg::Int(0));
        assert_eq!(c.args[5], Arg::Int(0));
    }

    #[test]
    fn modes_are_declared() {
        assert_eq!(lookup("PROC", Some("RUN")).unwrap().mode, Mode::Build);
        assert_eq!(lookup("PROC", Some("CRTE")).unwrap().mode, Mode::Base);
        assert_eq!(lookup("QUIT", None).unwrap().mode, Mode::Any);
    }

    #[test]
    fn help_mentions_every_command() {
        let help = help_text();
        for def in TABLE {
            assert!(help.contains(&def.full_name()), "{}", def.full_name());
        }
    }
}
