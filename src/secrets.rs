//! Relay access token.
//!
//! The token is read from a small TOML file:
//!
//! ```toml
//! token = "…"
//! ```
//!
//! It is never logged: `Debug` output is redacted.

use std::{fs, path::Path, str::FromStr};

use serde::Deserialize;
use veil::Redact;

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
#[redact(all)]
pub struct Token(String);

#[derive(Deserialize)]
struct SecretsFile {
    token: Option<Token>,
}

impl Token {
    /// Largest secrets file that is read at all.
    const MAX_FILE_SIZE: u64 = 1024;

    /// Loads the token from a secrets file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if:
    /// - the file cannot be read or is larger than 1 KiB
    /// - the file is not valid TOML or holds no `token`
    /// - the token is empty or contains whitespace
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Secrets files are tiny; refuse to slurp anything else.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let secrets: SecretsFile = toml::from_str(&contents)?;
        let token = secrets.token.ok_or_else(|| {
            Error::not_found(format!("{} does not contain a token", path.display()))
        })?;

        token.0.parse()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::invalid_argument("token should not be empty"));
        }
        if s.contains(char::is_whitespace) {
            return Err(Error::invalid_argument("token should not contain whitespace"));
        }
        Ok(Self(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn loads_token_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "token = \"abc123\"").unwrap();

        let token = Token::from_file(file.path()).unwrap();
        assert_eq!(token.as_str(), "abc123");
    }

    #[test]
    fn debug_output_is_redacted() {
        let token: Token = "super-secret".parse().unwrap();
        assert!(!format!("{token:?}").contains("super-secret"));
    }

    #[test]
    fn missing_token_is_not_found() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "other = 1").unwrap();

        let err = Token::from_file(file.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn oversized_file_is_refused() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "token = \"{}\"", "x".repeat(2048)).unwrap();

        let err = Token::from_file(file.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfRange);
    }
}
