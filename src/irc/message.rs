/// Inbound line parsing and outbound line composition for the client side.
///
/// Inbound lines are `[:prefix] command [middle ...] [:trailing]`, already
/// stripped of their terminator by the codec. Outbound lines never carry a
/// prefix.
use std::fmt::Write as _;

use serde::Serialize;

/// One line received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw prefix text without the leading `:`.
    pub prefix: Option<String>,
    /// The prefix decomposed, present exactly when `prefix` is.
    pub source: Option<Hostmask>,
    /// ASCII-uppercased command or three-digit numeric.
    pub command: String,
    pub params: Vec<String>,
    /// Whether the last parameter was introduced by `:`.
    pub trailing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

impl Message {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = match line.strip_prefix(':') {
            Some(tagged) => {
                let (prefix, rest) = tagged.split_once(' ').ok_or(ParseError::MissingCommand)?;
                (Some(prefix), rest)
            }
            None => (None, line),
        };

        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };
        let (command, middle) = head.split_once(' ').unwrap_or((head, ""));
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let middle = middle.strip_suffix(' ').unwrap_or(middle);
        let mut params: Vec<String> = match middle {
            "" => Vec::new(),
            middle => middle.split(' ').map(str::to_owned).collect(),
        };
        params.extend(trailing.map(str::to_owned));

        Ok(Message {
            prefix: prefix.map(str::to_owned),
            source: prefix.map(Hostmask::parse),
            command: command.to_ascii_uppercase(),
            params,
            trailing: trailing.is_some(),
        })
    }

    pub fn is_numeric(&self) -> bool {
        !self.command.is_empty() && self.command.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Render an outgoing line (no terminator). The last parameter always gets
/// a leading `:` so it may hold spaces.
pub fn compose(command: &str, params: &[&str]) -> String {
    let mut line = command.to_owned();
    if let Some((last, middle)) = params.split_last() {
        for param in middle {
            let _ = write!(line, " {param}");
        }
        let _ = write!(line, " :{last}");
    }
    line
}

/// A `nick!user@host` identity split into its parts.
///
/// When the text is not a well-formed hostmask every field holds the whole
/// text, so server-name prefixes still yield a usable "nickname".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hostmask {
    pub nickname: String,
    pub username: String,
    pub hostname: String,
}

impl Hostmask {
    pub fn parse(text: &str) -> Self {
        let text = remove_colon(text);
        if let (Some(bang), Some(at)) = (text.find('!'), text.find('@')) {
            if bang < at {
                return Self {
                    nickname: text[..bang].to_owned(),
                    username: text[bang + 1..at].to_owned(),
                    hostname: text[at + 1..].to_owned(),
                };
            }
        }
        Self {
            nickname: text.to_owned(),
            username: text.to_owned(),
            hostname: text.to_owned(),
        }
    }
}

/// Strip one leading `:` if present.
pub fn remove_colon(s: &str) -> &str {
    s.strip_prefix(':').unwrap_or(s)
}
