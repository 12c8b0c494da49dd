//! Module argument strings (`key=value key2="quoted value"`).

use std::fmt;

use crate::error::{Error, Result};

/// Ordered set of module arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleArgs {
    pairs: Vec<(String, String)>,
}

impl ModuleArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ModuleArgs::set`].
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Set `key`, replacing any previous value.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.pairs.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse a boolean argument (`1/0`, `yes/no`, `true/false`, `on/off`).
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "yes" | "y" | "true" | "on" => Ok(Some(true)),
            "0" | "no" | "n" | "false" | "off" => Ok(Some(false)),
            _ => Err(Error::InvalidArguments(format!(
                "{key} expects a boolean, got {raw:?}"
            ))),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Parse an argument string, accepting any key.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut args = ModuleArgs::new();
        let mut chars = raw.chars().peekable();
        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            loop {
                match chars.next() {
                    Some('=') => break,
                    Some(c) if c.is_whitespace() => {
                        return Err(Error::InvalidArguments(format!(
                            "argument {key:?} has no value"
                        )));
                    }
                    Some(c) => key.push(c),
                    None => {
                        return Err(Error::InvalidArguments(format!(
                            "argument {key:?} has no value"
                        )));
                    }
                }
            }
            if key.is_empty() {
                return Err(Error::InvalidArguments("empty argument name".to_string()));
            }

            let mut value = String::new();
            match chars.peek().copied() {
                Some(quote @ ('"' | '\'')) => {
                    chars.next();
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        match c {
                            '\\' => {
                                if let Some(escaped) = chars.next() {
                                    value.push(escaped);
                                }
                            }
                            c if c == quote => {
                                closed = true;
                                break;
                            }
                            c => value.push(c),
                        }
                    }
                    if !closed {
                        return Err(Error::InvalidArguments(format!(
                            "unterminated quote in {key:?}"
                        )));
                    }
                }
                _ => {
                    while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                        value.push(c);
                    }
                }
            }

            if args.get(&key).is_some() {
                return Err(Error::InvalidArguments(format!("duplicate argument {key:?}")));
            }
            args.pairs.push((key, value));
        }
        Ok(args)
    }

    /// Parse and reject keys outside `valid_keys`.
    pub fn parse_with(raw: &str, valid_keys: &[&str]) -> Result<Self> {
        let args = Self::parse(raw)?;
        if let Some(unknown) = args.keys().find(|k| !valid_keys.contains(k)) {
            return Err(Error::InvalidArguments(format!("unknown argument {unknown:?}")));
        }
        Ok(args)
    }
}

fn needs_quotes(value: &str) -> bool {
    let integer = !value.is_empty() && value.chars().all(|c| c.is_ascii_digit());
    !(integer || value == "true" || value == "false")
}

impl fmt::Display for ModuleArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if needs_quotes(value) {
                let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, "{key}=\"{escaped}\"")?;
            } else {
                write!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}
