//! Relative path model
//!
//! Every file a client addresses is named by a [`RelPath`]: a sequence of
//! tokens joined with [`SEPARATOR`]. Tokens never contain the separator,
//! never escape their parent (`..`) and never carry null bytes, so a
//! validated path can be joined onto a channel root without further checks.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::PathError;
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// Separator used on the wire and in composed paths
pub const SEPARATOR: char = '/';

/// The root path (no tokens)
pub const ROOT: &str = "";

/// A validated, separator-joined relative path.
///
/// The empty string is the root. `"/"` is accepted by [`RelPath::new`] as an
/// alias of the root and normalized to `""`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelPath {
    value: String,
}

impl RelPath {
    /// The root path
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a separator-joined path string.
    pub fn new(value: &str) -> Result<Self, PathError> {
        if value == ROOT || value == "/" {
            return Ok(Self::root());
        }
        if value.starts_with(SEPARATOR) {
            return Err(PathError::LeadingSeparator(value.into()));
        }
        check_length(value.len())?;

        for token in value.split(SEPARATOR) {
            if token.is_empty() {
                return Err(PathError::EmptyToken(value.into()));
            }
            validate_token(token)?;
        }

        Ok(Self {
            value: value.to_owned(),
        })
    }

    /// Compose a path from individual tokens.
    ///
    /// Empty tokens are the root and contribute nothing, so
    /// `from_tokens([ROOT])` is the root itself.
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = Self::root();
        path.append(tokens)?;
        Ok(path)
    }

    /// Append tokens in place. On error the path is left unchanged.
    pub fn append<I, S>(&mut self, tokens: I) -> Result<(), PathError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut value = self.value.clone();

        for token in tokens {
            let token = token.as_ref();
            if token.is_empty() {
                continue;
            }
            validate_token(token)?;
            if !value.is_empty() {
                value.push(SEPARATOR);
            }
            value.push_str(token);
        }

        check_length(value.len())?;
        self.value = value;
        Ok(())
    }

    /// Return a new path with `tokens` appended
    pub fn join<I, S>(&self, tokens: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = self.clone();
        path.append(tokens)?;
        Ok(path)
    }

    /// Concatenate another validated path
    pub fn concat(&self, other: &RelPath) -> Self {
        let mut value = self.value.clone();
        if !value.is_empty() && !other.value.is_empty() {
            value.push(SEPARATOR);
        }
        value.push_str(&other.value);
        Self { value }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_root(&self) -> bool {
        self.value.is_empty()
    }

    /// Iterate over the tokens of this path
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.value.split(SEPARATOR).filter(|t| !t.is_empty())
    }

    /// Last token, if any
    pub fn file_name(&self) -> Option<&str> {
        self.tokens().last()
    }

    /// Parent path (the root's parent is `None`)
    pub fn parent(&self) -> Option<RelPath> {
        if self.is_root() {
            return None;
        }
        let value = match self.value.rfind(SEPARATOR) {
            Some(idx) => self.value[..idx].to_owned(),
            None => String::new(),
        };
        Some(Self { value })
    }

    /// Resolve this path below a physical base directory
    pub fn to_physical(&self, base: &Path) -> PathBuf {
        let mut result = base.to_path_buf();
        for token in self.tokens() {
            result.push(token);
        }
        result
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl AsRef<str> for RelPath {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl TryFrom<&str> for RelPath {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Validate a single path token
pub fn validate_token(token: &str) -> Result<(), PathError> {
    if token.contains(SEPARATOR) {
        return Err(PathError::ContainsSeparator(token.into()));
    }

    // Windows would split the physical path on it
    #[cfg(windows)]
    if token.contains('\\') {
        return Err(PathError::PlatformSeparator(token.into()));
    }

    if token.contains('\0') {
        return Err(PathError::NullByte);
    }

    if token == "." || token == ".." {
        return Err(PathError::SpecialToken(token.into()));
    }

    if token.len() > MAX_FILENAME_LEN {
        return Err(PathError::TooLong {
            len: token.len(),
            max: MAX_FILENAME_LEN,
        });
    }

    Ok(())
}

fn check_length(len: usize) -> Result<(), PathError> {
    if len > MAX_PATH_LEN {
        return Err(PathError::TooLong {
            len,
            max: MAX_PATH_LEN,
        });
    }
    Ok(())
}
