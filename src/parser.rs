//! Speech/command parser - splits a message into ordered groups
//!
//! Tokens are whitespace separated. A token such as `!rping_8.8.8.8` is a
//! command: `!`, one flag character (`r` makes it blocking), then argv joined
//! by the separator. Everything else is speech. A blocking command followed
//! by more tokens ends its group, so nothing after it is spoken before the
//! command has finished.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{CueError, Result};
use crate::group::Group;
use crate::marker::{MarkerFormat, MarkerRegistry};
use crate::unit::ExecutionUnit;

/// A command token taken apart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub blocking: bool,
    pub argv: Vec<String>,
}

/// Recognizes command tokens and knows how markers are written
#[derive(Debug, Clone)]
pub struct CommandSyntax {
    pattern: Regex,
    blocking_flag: char,
    separator: char,
    marker: MarkerFormat,
}

impl CommandSyntax {
    pub fn new(
        flags: &str,
        blocking_flag: char,
        separator: char,
        marker: MarkerFormat,
    ) -> Result<Self> {
        if flags.is_empty() {
            return Err(CueError::Config("no command flags configured".into()));
        }
        let pattern = Regex::new(&format!(r"^!([{}])(\S+)$", regex::escape(flags)))
            .map_err(|e| CueError::Config(e.to_string()))?;
        Ok(Self {
            pattern,
            blocking_flag,
            separator,
            marker,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.commands.flags,
            config.commands.blocking_flag,
            config.commands.separator,
            MarkerFormat::new(&config.markers.template)?,
        )
    }

    pub fn marker(&self) -> &MarkerFormat {
        &self.marker
    }

    pub fn is_command(&self, token: &str) -> bool {
        self.pattern.is_match(token)
    }

    pub fn parse_command(&self, token: &str) -> Result<CommandSpec> {
        let caps = self
            .pattern
            .captures(token)
            .ok_or_else(|| CueError::MalformedToken(token.to_string()))?;

        let blocking = caps[1].starts_with(self.blocking_flag);
        let argv: Vec<String> = caps[2]
            .split(self.separator)
            .filter(|part| !part.is_empty())
            .map(String::from)
            .collect();

        if argv.is_empty() {
            return Err(CueError::MalformedToken(token.to_string()));
        }
        Ok(CommandSpec { blocking, argv })
    }
}

pub struct CommandParser {
    syntax: CommandSyntax,
    registry: Arc<MarkerRegistry>,
}

impl CommandParser {
    pub fn new(syntax: CommandSyntax, registry: Arc<MarkerRegistry>) -> Self {
        Self { syntax, registry }
    }

    pub fn syntax(&self) -> &CommandSyntax {
        &self.syntax
    }

    /// Split `input` into groups, registering a unit for every command token
    ///
    /// Tokens that look like commands but cannot become one are dropped with
    /// a warning. Empty input gives no groups.
    pub fn parse(&self, input: &str) -> Vec<Group> {
        let mut tokens = input.split_whitespace().peekable();
        let mut groups = Vec::new();
        let mut current = Group::default();

        while let Some(token) = tokens.next() {
            if !self.syntax.is_command(token) {
                current.push_text(token);
                continue;
            }

            match ExecutionUnit::create(token, &self.syntax, &self.registry) {
                Ok(unit) => {
                    let split = unit.is_blocking() && tokens.peek().is_some();
                    current.push_unit(unit);
                    if split {
                        groups.push(std::mem::take(&mut current));
                    }
                }
                Err(e) => warn!(token, "{}, dropping token", e),
            }
        }
        groups.push(current);

        groups.retain(|g| !g.is_empty());
        debug!(groups = groups.len(), "parsed message");
        groups
    }
}
