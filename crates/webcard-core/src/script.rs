//! Command script parsing.
//!
//! A command script is a compact, declarative description of the commands a
//! workflow sends to the card:
//!
//! ```text
//! [SelectBeCard][LoginBeCard][ReadHotpToken {serial_no=otp-1}]
//! ```
//!
//! Every top-level bracket group is one command. Its first token is the
//! command name and every following `{key=value}` group is a parameter.
//! Parameter groups without exactly one `=` are dropped, and a repeated key
//! overwrites the earlier value.
//!
//! # Example
//!
//! ```
//! use webcard_core::script::parse;
//!
//! let commands = parse("[SelectBeCard][ReadOtpToken {OtpMode=2}]");
//! assert_eq!(commands.len(), 2);
//! assert_eq!(commands[0].name(), "SelectBeCard");
//! assert!(commands[0].params().is_none());
//! assert_eq!(commands[1].param("OtpMode"), Some("2"));
//! ```

use std::collections::BTreeMap;
use std::fmt;

/// Parameters attached to a command.
pub type Params = BTreeMap<String, String>;

/// One command of a parsed script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    name: String,
    params: Option<Params>,
}

impl CommandDescriptor {
    /// Creates a descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Returns the command name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the parameters, or `None` when the group held only a name.
    #[must_use]
    pub const fn params(&self) -> Option<&Params> {
        self.params.as_ref()
    }

    /// Returns a single parameter value.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key).map(String::as_str)
    }

    /// Checks whether the command is a personalization command.
    #[must_use]
    pub fn is_personalization(&self) -> bool {
        self.name.starts_with("Personalize")
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.name)?;
        for (key, value) in self.params.iter().flatten() {
            write!(f, " {{{key}={value}}}")?;
        }
        f.write_str("]")
    }
}

/// Parses a command script into its commands, in order.
///
/// An empty script, or one without bracket groups, yields an empty list.
#[must_use]
pub fn parse(script: &str) -> Vec<CommandDescriptor> {
    delimited(script, '[', ']')
        .filter_map(|group| {
            let group = group.trim();
            if group.is_empty() {
                return None;
            }
            let (name, rest) = group
                .split_once(char::is_whitespace)
                .unwrap_or((group, ""));
            let params = (!rest.trim().is_empty()).then(|| parse_params(rest));
            Some(CommandDescriptor::new(name, params))
        })
        .collect()
}

fn parse_params(rest: &str) -> Params {
    let mut params = Params::new();
    for group in delimited(rest, '{', '}') {
        let mut parts = group.split('=');
        if let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) {
            params.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    params
}

/// Yields the text between each `open` and the next `close`, left to right.
fn delimited(text: &str, open: char, close: char) -> impl Iterator<Item = &str> {
    let mut cursor = text;
    std::iter::from_fn(move || {
        let start = cursor.find(open)? + open.len_utf8();
        let len = cursor[start..].find(close)?;
        let group = &cursor[start..start + len];
        cursor = &cursor[start + len + close.len_utf8()..];
        Some(group)
    })
}
