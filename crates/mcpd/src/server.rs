//! Launch specifications and their stable identifiers.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Everything needed to launch one MCP server child.
///
/// Immutable once built; the pool and the monitor clone it freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    auto_start: bool,
    optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("server command must not be empty")]
    Empty,
    #[error("invalid server command: {0}")]
    Parse(String),
}

impl ServerSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Result<Self, SpecError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(SpecError::Empty);
        }
        Ok(Self {
            command,
            args,
            env: BTreeMap::new(),
            auto_start: true,
            optional: false,
        })
    }

    /// Splits a full launch string with shell-word semantics: quotes and
    /// backslash escapes are honored, nothing is expanded.
    pub fn parse(command_line: &str) -> Result<Self, SpecError> {
        let words =
            shell_words::split(command_line).map_err(|err| SpecError::Parse(err.to_string()))?;
        let mut words = words.into_iter();
        let command = words.next().ok_or(SpecError::Empty)?;
        Self::new(command, words.collect())
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    pub fn optional(&self) -> bool {
        self.optional
    }

    /// Canonical launch string: command and args joined by single spaces.
    /// Two specs with the same canonical form are the same server.
    pub fn canonical(&self) -> String {
        let mut out = self.command.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    pub fn id(&self) -> ServerId {
        ServerId::derive(&self.canonical())
    }
}

/// Stable 12-hex-digit identifier of a launch specification.
///
/// Derived deterministically from the canonical launch string; opaque to
/// clients, never parsed by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(Box<str>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid server id: {0} (expected 12 lowercase hex digits)")]
pub struct ServerIdError(String);

impl ServerId {
    /// First 12 hex digits of SHA-256 over the canonical launch string.
    pub fn derive(canonical: &str) -> Self {
        let digest = Sha256::digest(canonical.as_bytes());
        Self(hex::encode(&digest[..6]).into_boxed_str())
    }

    pub fn parse(value: impl AsRef<str>) -> Result<Self, ServerIdError> {
        let value = value.as_ref();
        if value.len() != 12
            || !value
                .chars()
                .all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase())
        {
            return Err(ServerIdError(value.to_string()));
        }
        Ok(Self(value.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for ServerId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for ServerId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl Serialize for ServerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for ServerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}
