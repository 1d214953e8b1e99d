//! Configuration for arbor.
//!
//! Parses the INI-like config format (sections, optional quoted
//! subsections, `key = value` entries, `#`/`;` comments) and answers
//! `section.key` lookups. Later entries override earlier ones, matching the
//! scoping behavior callers expect from layered config files.

use std::path::Path;

use bstr::{BString, ByteSlice};

/// Errors from config parsing and lookup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config key: {0}")]
    InvalidKey(String),

    #[error("malformed config at {file}:{line}: {reason}")]
    Malformed {
        file: String,
        line: usize,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A normalized configuration key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    /// Lowercased section name.
    pub section: BString,
    /// Case-preserved subsection name (optional).
    pub subsection: Option<BString>,
    /// Lowercased variable name.
    pub name: BString,
}

impl ConfigKey {
    /// Parse from `"section.name"` or `"section.subsection.name"`.
    ///
    /// Section and variable names are lowercased; the subsection (which may
    /// itself contain dots) preserves case.
    pub fn parse(key: &str) -> Result<Self, ConfigError> {
        let key = key.trim();
        let first_dot = key
            .find('.')
            .ok_or_else(|| ConfigError::InvalidKey(format!("missing dot: {key}")))?;

        let section = &key[..first_dot];
        let rest = &key[first_dot + 1..];

        let (subsection, name) = match rest.rfind('.') {
            Some(last_dot) => (
                Some(BString::from(&rest[..last_dot])),
                &rest[last_dot + 1..],
            ),
            None => (None, rest),
        };

        if section.is_empty() || name.is_empty() {
            return Err(ConfigError::InvalidKey(format!(
                "empty section or variable name: {key}"
            )));
        }

        Ok(Self {
            section: BString::from(section.to_ascii_lowercase()),
            subsection,
            name: BString::from(name.to_ascii_lowercase()),
        })
    }
}

/// An in-memory view of layered configuration.
#[derive(Debug, Default)]
pub struct ConfigSet {
    /// (key, value) pairs in file order; later pairs win.
    values: Vec<(ConfigKey, BString)>,
}

impl ConfigSet {
    /// Create an empty config set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the repository-local config file under `git_dir`, if present.
    pub fn load(git_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let mut set = Self::new();
        if let Some(dir) = git_dir {
            let path = dir.join("config");
            if path.exists() {
                set.parse_file(&path)?;
            }
        }
        Ok(set)
    }

    /// Parse a config file and append its entries.
    pub fn parse_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let data = std::fs::read(path)?;
        self.parse_bytes(&data, &path.display().to_string())
    }

    /// Parse raw config bytes and append the entries.
    pub fn parse_bytes(&mut self, data: &[u8], filename: &str) -> Result<(), ConfigError> {
        let mut section: Option<(BString, Option<BString>)> = None;

        for (line_no, line) in data.lines().enumerate() {
            let line_no = line_no + 1;
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed[0] == b'#' || trimmed[0] == b';' {
                continue;
            }

            if trimmed[0] == b'[' {
                section = Some(parse_section_header(trimmed, filename, line_no)?);
                continue;
            }

            let (section_name, subsection) =
                section.as_ref().ok_or_else(|| ConfigError::Malformed {
                    file: filename.to_string(),
                    line: line_no,
                    reason: "entry before any section header".into(),
                })?;

            let (name, value) = parse_entry(trimmed, filename, line_no)?;
            self.values.push((
                ConfigKey {
                    section: section_name.clone(),
                    subsection: subsection.clone(),
                    name,
                },
                value,
            ));
        }

        Ok(())
    }

    /// Set a value programmatically (appended, so it overrides file values).
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let key = ConfigKey::parse(key)?;
        self.values.push((key, BString::from(value)));
        Ok(())
    }

    /// Look up the effective value for `"section.key"`.
    pub fn get_string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let wanted = ConfigKey::parse(key)?;
        Ok(self
            .values
            .iter()
            .rev()
            .find(|(k, _)| *k == wanted)
            .map(|(_, v)| v.to_string()))
    }

    /// Look up a boolean value. Missing keys yield `None`.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get_string(key)? {
            None => Ok(None),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" | "" => Ok(Some(true)),
                "false" | "no" | "off" | "0" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidKey(format!(
                    "not a boolean: {key} = {v}"
                ))),
            },
        }
    }
}

/// Parse `[section]` or `[section "subsection"]`.
fn parse_section_header(
    line: &[u8],
    filename: &str,
    line_no: usize,
) -> Result<(BString, Option<BString>), ConfigError> {
    let malformed = |reason: &str| ConfigError::Malformed {
        file: filename.to_string(),
        line: line_no,
        reason: reason.to_string(),
    };

    let close = line
        .iter()
        .position(|&b| b == b']')
        .ok_or_else(|| malformed("unclosed section header"))?;
    let inner = line[1..close].trim();

    if let Some(quote) = inner.iter().position(|&b| b == b'"') {
        let name = inner[..quote].trim();
        let sub = &inner[quote + 1..];
        let end_quote = sub
            .iter()
            .position(|&b| b == b'"')
            .ok_or_else(|| malformed("unterminated subsection quote"))?;
        Ok((
            BString::from(name.to_ascii_lowercase()),
            Some(BString::from(&sub[..end_quote])),
        ))
    } else {
        Ok((BString::from(inner.to_ascii_lowercase()), None))
    }
}

/// Parse `key = value` (or a bare `key`, which means boolean true).
fn parse_entry(
    line: &[u8],
    filename: &str,
    line_no: usize,
) -> Result<(BString, BString), ConfigError> {
    let (key, value) = match line.iter().position(|&b| b == b'=') {
        Some(eq) => {
            let raw_value = line[eq + 1..].trim();
            // Strip a single pair of surrounding quotes.
            let value = if raw_value.len() >= 2
                && raw_value[0] == b'"'
                && raw_value[raw_value.len() - 1] == b'"'
            {
                &raw_value[1..raw_value.len() - 1]
            } else {
                raw_value
            };
            (line[..eq].trim(), value)
        }
        None => (line, &b""[..]),
    };

    if key.is_empty() {
        return Err(ConfigError::Malformed {
            file: filename.to_string(),
            line: line_no,
            reason: "empty key".into(),
        });
    }

    Ok((
        BString::from(key.to_ascii_lowercase()),
        BString::from(value),
    ))
}
