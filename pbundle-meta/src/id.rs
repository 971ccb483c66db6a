//! AppBundleID parsing and canonicalization
//!
//! Three syntactic forms are accepted:
//! - Type I (legacy): `name-DATE-maintainer` or `name-version-maintainer`
//! - Type II: `name#repo[:version]`
//! - Type III: `name#repo[:version]@DATE`
//!
//! The canonical serialization is the highest type for which all required
//! fields are present. The legacy maintainer is stored in `repo`.

use std::{fmt::Display, sync::OnceLock};

use regex::Regex;

use crate::error::{Error, Result};

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._/-]+$").unwrap())
}

fn repo_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Underscores show up in legacy maintainer strings, so they are accepted
    // here on top of the name charset.
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._/_-]+$").unwrap())
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._]+$").unwrap())
}

fn date_res() -> &'static [Regex; 3] {
    static RE: OnceLock<[Regex; 3]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"^\d{2}_\d{2}_\d{4}$").unwrap(), // DD_MM_YYYY
            Regex::new(r"^\d{8}$").unwrap(),             // YYYYMMDD
            Regex::new(r"^\d{4}_\d{2}_\d{2}$").unwrap(), // YYYY_MM_DD
        ]
    })
}

fn is_date(text: &str) -> bool {
    date_res().iter().any(|re| re.is_match(text))
}

/// Human-readable bundle identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBundleId {
    pub name: String,
    pub repo: String,
    pub version: Option<String>,
    pub date: Option<String>,
}

impl AppBundleId {
    /// Parse any of the three accepted forms.
    ///
    /// Stored fields are normalized: repo slashes become dots, version
    /// hyphens become underscores.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidId("empty identity string".into()));
        }

        if let Some((name, rest)) = input.split_once('#') {
            // Type II / III
            let (rest, date) = match rest.rsplit_once('@') {
                Some((head, date)) => (head, Some(date)),
                None => (rest, None),
            };
            let (repo, version) = match rest.split_once(':') {
                Some((repo, version)) => (repo, Some(version)),
                None => (rest, None),
            };
            Self::build(input, name, repo, version, date)
        } else {
            // Type I legacy. The name itself may contain hyphens, so the
            // maintainer and the date/version are split off from the right.
            let (head, maintainer) = input
                .rsplit_once('-')
                .ok_or_else(|| Error::InvalidId(format!("unrecognized form: {input:?}")))?;
            let (name, middle) = head
                .rsplit_once('-')
                .ok_or_else(|| Error::InvalidId(format!("unrecognized form: {input:?}")))?;
            if is_date(middle) {
                Self::build(input, name, maintainer, None, Some(middle))
            } else {
                Self::build(input, name, maintainer, Some(middle), None)
            }
        }
    }

    fn build(
        input: &str,
        name: &str,
        repo: &str,
        version: Option<&str>,
        date: Option<&str>,
    ) -> Result<Self> {
        if !name_re().is_match(name) {
            return Err(Error::InvalidId(format!("bad name {name:?} in {input:?}")));
        }
        if !repo_re().is_match(repo) {
            return Err(Error::InvalidId(format!("bad repo {repo:?} in {input:?}")));
        }
        let version = match version {
            Some(v) => {
                let v = v.replace('-', "_");
                if !version_re().is_match(&v) {
                    return Err(Error::InvalidId(format!("bad version in {input:?}")));
                }
                Some(v)
            }
            None => None,
        };
        let date = match date {
            Some(d) => {
                if !is_date(d) {
                    return Err(Error::InvalidId(format!("bad date {d:?} in {input:?}")));
                }
                Some(d.to_string())
            }
            None => None,
        };
        Ok(Self {
            name: name.to_string(),
            repo: repo.replace('/', "."),
            version,
            date,
        })
    }

    /// The identity reduced to `[A-Za-z0-9_]`, safe in environment-variable
    /// names and path fragments.
    pub fn sanitized(&self) -> String {
        sanitize(&self.to_string())
    }
}

impl Display for AppBundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.repo)?;
        if let Some(ref version) = self.version {
            write!(f, ":{}", version)?;
        }
        if let Some(ref date) = self.date {
            write!(f, "@{}", date)?;
        }
        Ok(())
    }
}

/// Drop every character outside `[A-Za-z0-9_]`.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}
