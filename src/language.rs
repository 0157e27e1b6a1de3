//! OCR languages we know how to request.
//!
//! Language selection only ever reaches the OCR tool through
//! [`Language::code`], so nothing a client sends can end up on the tool's
//! command line verbatim.

use std::{fmt, str::FromStr};

use crate::prelude::*;

/// A language with an installed `tesseract` language pack.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Language {
    /// English (`eng`).
    English,
    /// Swedish (`swe`).
    Swedish,
}

impl Language {
    /// The `tesseract` language code.
    pub fn code(self) -> &'static str {
        match self {
            Language::English => "eng",
            Language::Swedish => "swe",
        }
    }

    /// The English name of this language.
    pub fn name(self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Swedish => "Swedish",
        }
    }

    /// Parse a list like `eng+swe`, `eng,swe` or `eng swe`.
    ///
    /// Query strings decode `+` as a space, so all three separators are
    /// accepted. The result is sorted and deduplicated.
    pub fn parse_list(s: &str) -> Result<Vec<Language>> {
        let mut languages = s
            .split(['+', ',', ' '])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Language::from_str)
            .collect::<Result<Vec<_>>>()?;
        canonicalize(&mut languages);
        Ok(languages)
    }

    /// Join languages the way `ocrmypdf --language` expects.
    pub fn join_codes(languages: &[Language]) -> String {
        languages
            .iter()
            .map(|l| l.code())
            .collect::<Vec<_>>()
            .join("+")
    }
}

/// Sort and deduplicate a language list, so equal selections always produce
/// the same tool arguments.
pub fn canonicalize(languages: &mut Vec<Language>) {
    languages.sort();
    languages.dedup();
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eng" | "en" | "english" => Ok(Language::English),
            "swe" | "sv" | "swedish" => Ok(Language::Swedish),
            _ => Err(anyhow!("Unsupported OCR language: {:?}", s)),
        }
    }
}
