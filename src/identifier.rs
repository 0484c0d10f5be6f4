//! arXiv identifier parsing and normalisation.
//!
//! arXiv has used two identifier schemes:
//!
//! | Scheme | Example | Since |
//! |--------|---------|-------|
//! | modern | `2301.00001`, `0704.0001v2` | April 2007 |
//! | legacy | `hep-th/9901001`, `math.AG/0601001v1` | 1991 |
//!
//! Users paste identifiers in many decorated shapes (`arXiv:2301.00001`,
//! `https://arxiv.org/abs/2301.00001v2`, `…/pdf/2301.00001.pdf`). All of
//! them normalise to the bare form, and normalising an already normalised
//! identifier is a no-op.

use crate::error::PipelineError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static RE_MODERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2})(\d{2})\.(\d{4,5})(v\d+)?$").unwrap());

static RE_LEGACY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z]+(?:-[a-z]+)*)(\.[A-Z]{2})?/(\d{7})(v\d+)?$").unwrap()
});

static RE_URL_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:https?://)?(?:www\.|export\.)?arxiv\.org/(?:abs|pdf|e-print|format)/")
        .unwrap()
});

/// A validated, normalised arXiv identifier.
///
/// Constructed only through [`ItemIdentifier::parse`] (or `FromStr`), so every
/// value matches one of the two structural patterns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemIdentifier {
    id: String,
    legacy: bool,
}

impl ItemIdentifier {
    /// Parse and normalise a user-supplied identifier.
    pub fn parse(input: &str) -> Result<Self, PipelineError> {
        let normalised = normalize(input)?;
        let legacy = normalised.contains('/');
        Ok(Self {
            id: normalised,
            legacy,
        })
    }

    /// The normalised identifier, including any version suffix.
    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// The identifier without its `vN` suffix.
    pub fn base(&self) -> &str {
        match self.version_start() {
            Some(pos) => &self.id[..pos],
            None => &self.id,
        }
    }

    /// Explicit version number, when the identifier pins one.
    pub fn version(&self) -> Option<u32> {
        self.version_start()
            .and_then(|pos| self.id[pos + 1..].parse().ok())
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Filesystem-safe name for artifact paths (`hep-th/9901001` → `hep-th_9901001`).
    pub fn file_stem(&self) -> String {
        self.id.replace('/', "_")
    }

    fn version_start(&self) -> Option<usize> {
        let tail_start = self.id.rfind(['.', '/']).unwrap_or(0);
        self.id[tail_start..].rfind('v').map(|p| tail_start + p)
    }
}

impl fmt::Display for ItemIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl FromStr for ItemIdentifier {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ItemIdentifier {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ItemIdentifier> for String {
    fn from(value: ItemIdentifier) -> Self {
        value.id
    }
}

/// Normalise an identifier string to its canonical bare form.
///
/// Strips whitespace, `arXiv:` prefixes, arxiv.org URLs and a trailing
/// `.pdf`; lower-cases the legacy archive name and upper-cases its subject
/// class. Returns [`PipelineError::InvalidIdentifier`] when the result matches
/// neither scheme.
pub fn normalize(input: &str) -> Result<String, PipelineError> {
    let invalid = || PipelineError::InvalidIdentifier {
        input: input.to_string(),
    };

    let mut s = input.trim();
    s = RE_URL_PREFIX
        .find(s)
        .map(|m| &s[m.end()..])
        .unwrap_or(s);
    if s.get(..6).is_some_and(|p| p.eq_ignore_ascii_case("arxiv:")) {
        s = &s[6..];
    }
    s = s.trim_end_matches('/');
    if s
        .len()
        .checked_sub(4)
        .and_then(|i| s.get(i..))
        .is_some_and(|ext| ext.eq_ignore_ascii_case(".pdf"))
    {
        s = &s[..s.len() - 4];
    }
    let s = s.trim();

    if let Some(caps) = RE_MODERN.captures(&s.to_ascii_lowercase()) {
        let month: u32 = caps[2].parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }
        return Ok(caps[0].to_string());
    }

    let (archive_part, number) = s.split_once('/').ok_or_else(invalid)?;
    let archive_part = match archive_part.split_once('.') {
        Some((archive, class)) => format!(
            "{}.{}",
            archive.to_ascii_lowercase(),
            class.to_ascii_uppercase()
        ),
        None => archive_part.to_ascii_lowercase(),
    };
    let candidate = format!("{}/{}", archive_part, number.to_ascii_lowercase());
    if RE_LEGACY.is_match(&candidate) {
        Ok(candidate)
    } else {
        Err(invalid())
    }
}
