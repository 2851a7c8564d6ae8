//! A single channel subscription: a glob compiled to a regular expression.
//!
//! `*` matches one or more characters that are not `.`, every other
//! character is literal; `.` therefore separates segments. Examples:
//! `hello`, `hello.*`, `hello.*.properties`.

use regex::Regex;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct Subscription {
    name: String,
    pattern: Regex,
}

impl Subscription {
    /// Compile a glob. The pattern is anchored: the whole channel name must
    /// match.
    pub fn parse(name: &str) -> AppResult<Self> {
        let inner = name
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("[^.]+");
        let pattern = Regex::new(&format!("^{}$", inner))
            .map_err(|e| AppError::Config(format!("subscription {:?}: {}", name, e)))?;

        Ok(Subscription {
            name: name.to_string(),
            pattern,
        })
    }

    pub fn matches(&self, channel: &str) -> bool {
        self.pattern.is_match(channel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
