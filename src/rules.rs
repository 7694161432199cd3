//! Rule file parsing and authorization decisions
//!
//! A rule file holds one rule per line:
//!
//! ```text
//! permit|deny [options] identity [as target] [cmd command [args...]]
//! ```
//!
//! Rules are evaluated in file order and the first rule whose identity
//! matches the principal decides the request.

use crate::error::{DoasError, ParseErrorKind, Result};
use crate::groups::GroupDatabase;
use bitflags::bitflags;
use nix::unistd::Gid;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

bitflags! {
    /// Per-rule options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RuleOptions: u8 {
        /// Run without re-authenticating
        const NOPASS  = 0b0000_0001;
        /// Remember a successful authentication for the persist window
        const PERSIST = 0b0000_0010;
        /// Do not write the audit line for executed commands
        const NOLOG   = 0b0000_0100;
        /// Keep the invoking principal's `PATH`
        const KEEPENV = 0b0000_1000;
        /// Recognized, no runtime effect
        const SETENV  = 0b0001_0000;
    }
}

impl RuleOptions {
    fn from_keyword(token: &str) -> Option<Self> {
        match token {
            "nopass" => Some(Self::NOPASS),
            "persist" => Some(Self::PERSIST),
            "nolog" => Some(Self::NOLOG),
            "keepenv" => Some(Self::KEEPENV),
            "setenv" => Some(Self::SETENV),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Permit,
    Deny,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Permit => write!(f, "permit"),
            Action::Deny => write!(f, "deny"),
        }
    }
}

/// Who a rule applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    /// Group name without the leading `:`
    Group(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(name) => write!(f, "{}", name),
            Identity::Group(name) => write!(f, ":{}", name),
        }
    }
}

/// Restricts a rule to one command, optionally with fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRestriction {
    pub path: PathBuf,
    /// Empty means any arguments
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub options: RuleOptions,
    pub identity: Identity,
    pub target: Option<String>,
    pub cmd: Option<CommandRestriction>,
    /// 1-based line in the rule file
    pub line: usize,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action)?;
        for (name, _) in self.options.iter_names() {
            write!(f, " {}", name.to_ascii_lowercase())?;
        }
        write!(f, " {}", self.identity)?;
        if let Some(target) = &self.target {
            write!(f, " as {}", target)?;
        }
        if let Some(cmd) = &self.cmd {
            write!(f, " cmd {}", cmd.path.display())?;
            for arg in &cmd.args {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Rules in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

/// The request being authorized
#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub user: &'a str,
    pub gids: &'a [Gid],
    pub target: &'a str,
    /// Resolved absolute path of the command, if it could be resolved
    pub command: Option<&'a Path>,
    pub args: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<'a> {
    Permit(&'a Rule),
    Deny,
    NotAuthorized,
}

/// Load and parse a rule file.
pub fn load(path: &Path) -> Result<RuleSet> {
    let content = fs::read_to_string(path).map_err(|e| DoasError::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse(&content, path)
}

/// Parse rule file content. `origin` is only used in error messages.
pub fn parse(content: &str, origin: &Path) -> Result<RuleSet> {
    let mut rules = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        match parse_line(line, line_no) {
            Ok(Some(rule)) => rules.push(rule),
            Ok(None) => {}
            Err(kind) => {
                return Err(DoasError::Parse {
                    path: origin.to_path_buf(),
                    line: line_no,
                    kind,
                })
            }
        }
    }
    debug!("Loaded {} rule(s) from {}", rules.len(), origin.display());
    Ok(RuleSet { rules })
}

/// Parse one line. Blank lines and comments yield `Ok(None)`.
pub fn parse_line(line: &str, line_no: usize) -> std::result::Result<Option<Rule>, ParseErrorKind> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    let mut pos = 0;

    let action = match tokens[pos] {
        "permit" => Action::Permit,
        "deny" => Action::Deny,
        _ => return Err(ParseErrorKind::MissingAction),
    };
    pos += 1;

    let mut options = RuleOptions::empty();
    while let Some(&tok) = tokens.get(pos) {
        if tok == "as" || tok == "cmd" {
            break;
        }
        match RuleOptions::from_keyword(tok) {
            Some(opt) => options |= opt,
            None => break,
        }
        pos += 1;
    }

    let identity = match tokens.get(pos) {
        Some(tok) => match tok.strip_prefix(':') {
            Some(group) => Identity::Group(group.to_string()),
            None => Identity::User(tok.to_string()),
        },
        None => return Err(ParseErrorKind::MissingIdentity),
    };
    pos += 1;

    let mut target = None;
    if tokens.get(pos) == Some(&"as") {
        if let Some(name) = tokens.get(pos + 1) {
            target = Some(name.to_string());
            pos += 2;
        }
    }

    let mut cmd = None;
    if tokens.get(pos) == Some(&"cmd") {
        let path = tokens.get(pos + 1).ok_or(ParseErrorKind::DanglingCmd)?;
        cmd = Some(CommandRestriction {
            path: PathBuf::from(path),
            args: tokens[pos + 2..].iter().map(|s| s.to_string()).collect(),
        });
        pos = tokens.len();
    }

    if let Some(extra) = tokens.get(pos) {
        return Err(ParseErrorKind::UnexpectedToken(extra.to_string()));
    }

    Ok(Some(Rule {
        action,
        options,
        identity,
        target,
        cmd,
        line: line_no,
    }))
}

impl RuleSet {
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// First rule, in file order, whose identity covers the principal.
    ///
    /// The group database is only consulted for group rules reached before
    /// a match.
    pub fn first_match(
        &self,
        user: &str,
        gids: &[Gid],
        groups: &GroupDatabase,
    ) -> Result<Option<&Rule>> {
        for rule in &self.rules {
            let hit = match &rule.identity {
                Identity::User(name) => name == user,
                Identity::Group(name) => groups.group_reference_matches_substring(name, gids)?,
            };
            if hit {
                debug!("Rule at line {} matches {}", rule.line, user);
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    /// Decide a request.
    ///
    /// Only the first matching rule is considered. Its target, command and
    /// argument restrictions turn a permit into a deny when they do not hold.
    pub fn resolve(&self, request: &Request<'_>, groups: &GroupDatabase) -> Result<Decision<'_>> {
        let Some(rule) = self.first_match(request.user, request.gids, groups)? else {
            debug!("No rule matches {}", request.user);
            return Ok(Decision::NotAuthorized);
        };

        if let Some(target) = &rule.target {
            if target != request.target {
                debug!("Line {}: target {} not allowed", rule.line, request.target);
                return Ok(Decision::Deny);
            }
        }

        if let Some(restriction) = &rule.cmd {
            let Some(command) = request.command else {
                debug!("Line {}: command could not be resolved", rule.line);
                return Ok(Decision::Deny);
            };
            if command != restriction.path {
                debug!("Line {}: command {} not allowed", rule.line, command.display());
                return Ok(Decision::Deny);
            }
            if !restriction.args.is_empty() && restriction.args != request.args {
                debug!("Line {}: arguments not allowed", rule.line);
                return Ok(Decision::Deny);
            }
        }

        Ok(match rule.action {
            Action::Permit => Decision::Permit(rule),
            Action::Deny => Decision::Deny,
        })
    }
}
