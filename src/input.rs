use std::{collections::BTreeMap, fmt::Display};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Schemes accepted in the URL form of an input. The `git+` prefix is
/// stripped for internal use and restored by [`Input::to_url`].
const SCHEMES: [&str; 5] = ["git", "git+http", "git+https", "git+ssh", "git+file"];

/// Attribute keys recognized by the attribute form; anything else is
/// rejected.
const KNOWN_ATTRS: [&str; 11] = [
    "type",
    "url",
    "ref",
    "rev",
    "shallow",
    "submodules",
    "allRefs",
    "lastModified",
    "revCount",
    "narHash",
    "name",
];

pub const INPUT_TYPE: &str = "git";

/// Name used for store entries when the caller does not supply one.
pub const DEFAULT_NAME: &str = "source";

/// A loosely typed attribute value, the wire form of input metadata and
/// of the two-level cache records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attr {
    Bool(bool),
    Int(u64),
    String(String),
}

pub type Attrs = BTreeMap<String, Attr>;

impl Attr {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attr::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attr::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Attr::Int(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("invalid URL '{url}': {source}")]
    BadUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("unsupported Git input attribute '{0}'")]
    UnsupportedAttribute(String),
    #[error("Git input attribute '{attr}' has the wrong type")]
    WrongAttrType { attr: &'static str },
    #[error("input is not of type '{INPUT_TYPE}'")]
    WrongType,
    #[error("invalid Git branch/tag name '{0}'")]
    BadRefName(String),
    #[error("invalid Git revision '{0}'; expected a 40- or 64-digit hex commit id")]
    BadRevision(String),
    #[error("Git input '{0}' has a commit hash but no branch/tag name")]
    RevWithoutRef(String),
}

/// A Git input specification, unlocked or locked.
///
/// The input is *locked* iff `rev` is set; a locked input plus the
/// fetcher-populated metadata (`nar_hash`, `last_modified`, `rev_count`)
/// fully identifies an immutable snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    /// Transport URL with the `git+` prefix stripped. Query parameters
    /// that are not part of the input identity are retained here.
    pub url: Url,
    pub ref_name: Option<String>,
    pub rev: Option<String>,
    pub shallow: bool,
    pub submodules: bool,
    pub all_refs: bool,
    pub name: Option<String>,
    pub nar_hash: Option<String>,
    pub last_modified: Option<u64>,
    pub rev_count: Option<u64>,
}

impl Input {
    /// Parse the URL form:
    /// `(git|git+http|git+https|git+ssh|git+file)://…?rev=…&ref=…&shallow=0|1&submodules=0|1`.
    ///
    /// `rev` and `ref` query parameters become attributes, `shallow` and
    /// `submodules` become boolean attributes (`"1"` = true); all other
    /// query parameters stay on the transport URL.
    pub fn from_url(url: &str) -> Result<Self, InputError> {
        let scheme = url.split(':').next().unwrap_or("");
        if !SCHEMES.contains(&scheme) {
            return Err(InputError::UnsupportedScheme(scheme.to_string()));
        }

        // `Url::set_scheme` refuses most special/non-special scheme
        // changes, so the `git+` prefix is stripped before parsing.
        let stripped = url.strip_prefix("git+").unwrap_or(url);
        let mut parsed = Url::parse(stripped).map_err(|source| InputError::BadUrl {
            url: url.to_string(),
            source,
        })?;

        let mut attrs = Attrs::new();
        attrs.insert("type".into(), Attr::String(INPUT_TYPE.into()));

        let mut retained: Vec<(String, String)> = Vec::new();
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "rev" | "ref" => {
                    attrs.insert(key.to_string(), Attr::String(value.to_string()));
                }
                "shallow" | "submodules" => {
                    attrs.insert(key.to_string(), Attr::Bool(value == "1"));
                }
                _ => retained.push((key.to_string(), value.to_string())),
            }
        }
        set_sorted_query(&mut parsed, retained);

        attrs.insert("url".into(), Attr::String(parsed.to_string()));

        Self::from_attrs(attrs)
    }

    /// Parse the attribute form. Unknown keys are rejected, `type` must
    /// be `"git"`, `ref` must not match the bad-ref-name pattern and
    /// `rev` must be a hex commit id.
    pub fn from_attrs(attrs: Attrs) -> Result<Self, InputError> {
        if attrs.get("type").and_then(Attr::as_str) != Some(INPUT_TYPE) {
            return Err(InputError::WrongType);
        }

        for key in attrs.keys() {
            if !KNOWN_ATTRS.contains(&key.as_str()) {
                return Err(InputError::UnsupportedAttribute(key.clone()));
            }
        }

        let url_str = str_attr(&attrs, "url")?.ok_or(InputError::WrongAttrType { attr: "url" })?;
        let url = Url::parse(&url_str).map_err(|source| InputError::BadUrl {
            url: url_str.clone(),
            source,
        })?;

        let ref_name = str_attr(&attrs, "ref")?;
        if let Some(ref_name) = &ref_name {
            validate_ref_name(ref_name)?;
        }

        let rev = str_attr(&attrs, "rev")?;
        if let Some(rev) = &rev {
            validate_rev(rev)?;
        }
        if rev.is_some() && ref_name.is_none() {
            return Err(InputError::RevWithoutRef(url_str));
        }

        Ok(Input {
            url,
            ref_name,
            rev,
            shallow: bool_attr(&attrs, "shallow")?.unwrap_or(false),
            submodules: bool_attr(&attrs, "submodules")?.unwrap_or(false),
            all_refs: bool_attr(&attrs, "allRefs")?.unwrap_or(false),
            name: str_attr(&attrs, "name")?,
            nar_hash: str_attr(&attrs, "narHash")?,
            last_modified: int_attr(&attrs, "lastModified")?,
            rev_count: int_attr(&attrs, "revCount")?,
        })
    }

    /// Inverse of [`Input::from_attrs`].
    pub fn to_attrs(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert("type".into(), Attr::String(INPUT_TYPE.into()));
        attrs.insert("url".into(), Attr::String(self.url.to_string()));
        if let Some(ref_name) = &self.ref_name {
            attrs.insert("ref".into(), Attr::String(ref_name.clone()));
        }
        if let Some(rev) = &self.rev {
            attrs.insert("rev".into(), Attr::String(rev.clone()));
        }
        if self.shallow {
            attrs.insert("shallow".into(), Attr::Bool(true));
        }
        if self.submodules {
            attrs.insert("submodules".into(), Attr::Bool(true));
        }
        if self.all_refs {
            attrs.insert("allRefs".into(), Attr::Bool(true));
        }
        if let Some(name) = &self.name {
            attrs.insert("name".into(), Attr::String(name.clone()));
        }
        if let Some(nar_hash) = &self.nar_hash {
            attrs.insert("narHash".into(), Attr::String(nar_hash.clone()));
        }
        if let Some(last_modified) = self.last_modified {
            attrs.insert("lastModified".into(), Attr::Int(last_modified));
        }
        if let Some(rev_count) = self.rev_count {
            attrs.insert("revCount".into(), Attr::Int(rev_count));
        }
        attrs
    }

    /// Inverse of [`Input::from_url`]: restores the `git+` scheme prefix
    /// and promotes `rev`, `ref` and `shallow` back into the query,
    /// sorted by key.
    pub fn to_url(&self) -> Url {
        let mut pairs: Vec<(String, String)> = self
            .url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let Some(rev) = &self.rev {
            pairs.push(("rev".into(), rev.clone()));
        }
        if let Some(ref_name) = &self.ref_name {
            pairs.push(("ref".into(), ref_name.clone()));
        }
        if self.shallow {
            pairs.push(("shallow".into(), "1".into()));
        }

        let mut url = self.url.clone();
        set_sorted_query(&mut url, pairs);

        if url.scheme() == "git" {
            url
        } else {
            let prefixed = format!("git+{}", url);
            // A `git+` scheme always reparses: it only widens the scheme.
            Url::parse(&prefixed).expect("prefixed URL must reparse")
        }
    }

    /// Overwrite `ref` and/or `rev`. The result must not pin a revision
    /// without naming the ref it came from.
    pub fn apply_overrides(
        mut self,
        ref_name: Option<String>,
        rev: Option<String>,
    ) -> Result<Self, InputError> {
        if let Some(rev) = rev {
            validate_rev(&rev)?;
            self.rev = Some(rev);
        }
        if let Some(ref_name) = ref_name {
            validate_ref_name(&ref_name)?;
            self.ref_name = Some(ref_name);
        }
        if self.rev.is_some() && self.ref_name.is_none() {
            return Err(InputError::RevWithoutRef(self.to_string()));
        }
        Ok(self)
    }

    /// An input is locked iff its revision is pinned.
    pub fn is_locked(&self) -> bool {
        self.rev.is_some()
    }

    /// `"<rev>;<0|1>"` (submodules flag), usable by callers as a cache
    /// key for derived evaluations. Absent while unlocked.
    pub fn fingerprint(&self) -> Option<String> {
        self.rev
            .as_ref()
            .map(|rev| format!("{};{}", rev, if self.submodules { "1" } else { "0" }))
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }
}

impl Display for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_url())
    }
}

fn str_attr(attrs: &Attrs, key: &'static str) -> Result<Option<String>, InputError> {
    match attrs.get(key) {
        None => Ok(None),
        Some(Attr::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(InputError::WrongAttrType { attr: key }),
    }
}

fn bool_attr(attrs: &Attrs, key: &'static str) -> Result<Option<bool>, InputError> {
    match attrs.get(key) {
        None => Ok(None),
        Some(Attr::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(InputError::WrongAttrType { attr: key }),
    }
}

fn int_attr(attrs: &Attrs, key: &'static str) -> Result<Option<u64>, InputError> {
    match attrs.get(key) {
        None => Ok(None),
        Some(Attr::Int(n)) => Ok(Some(*n)),
        Some(_) => Err(InputError::WrongAttrType { attr: key }),
    }
}

fn set_sorted_query(url: &mut Url, mut pairs: Vec<(String, String)>) {
    if pairs.is_empty() {
        url.set_query(None);
        return;
    }
    pairs.sort();
    let mut query = url.query_pairs_mut();
    query.clear();
    for (key, value) in &pairs {
        query.append_pair(key, value);
    }
    drop(query);
}

/// Reject branch/tag names git itself would refuse: embedded whitespace
/// or control characters, `..`, `@{`, `//`, a leading `-`, `.` or `/`,
/// a trailing `/` or `.lock`, and the metacharacters `^ ~ : ? * [ \`.
pub fn validate_ref_name(ref_name: &str) -> Result<(), InputError> {
    let bad_ref = Regex::new(
        r"^$|^-|^\.|^/|/$|\.lock$|\.\.|@\{|//|[\x00-\x1f\x7f \t^~:?*\[\\]",
    )
    .unwrap();
    if bad_ref.is_match(ref_name) {
        return Err(InputError::BadRefName(ref_name.to_string()));
    }
    Ok(())
}

/// A revision is a full SHA-1 (40) or SHA-256 (64) hex commit id.
pub fn validate_rev(rev: &str) -> Result<(), InputError> {
    let len = rev.len();
    if (len == 40 || len == 64) && rev.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(InputError::BadRevision(rev.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    const REV: &str = "29b0b4b9b85cdc45395b0d4b0d1128dbd4cde8cd";

    #[test]
    fn parses_url_form() {
        let input = Input::from_url(&format!(
            "git+https://example.org/repo.git?ref=main&rev={REV}&shallow=1&foo=bar"
        ))
        .unwrap();
        assert_eq!(input.url.as_str(), "https://example.org/repo.git?foo=bar");
        assert_eq!(input.ref_name.as_deref(), Some("main"));
        assert_eq!(input.rev.as_deref(), Some(REV));
        assert!(input.shallow);
        assert!(!input.submodules);
    }

    #[test]
    fn url_roundtrip_is_identity() {
        for url in [
            format!("git+https://example.org/repo.git?foo=bar&ref=main&rev={REV}"),
            "git+ssh://git@example.org/repo.git?ref=main".to_string(),
            "git://example.org/repo.git?ref=main&shallow=1".to_string(),
        ] {
            let input = Input::from_url(&url).unwrap();
            assert_eq!(input.to_url().to_string(), url);
        }
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            Input::from_url("https://example.org/repo.git"),
            Err(InputError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn rejects_unknown_attribute() {
        let mut attrs = Attrs::new();
        attrs.insert("type".into(), Attr::String("git".into()));
        attrs.insert("url".into(), Attr::String("https://example.org/r".into()));
        attrs.insert("branch".into(), Attr::String("main".into()));
        assert!(matches!(
            Input::from_attrs(attrs),
            Err(InputError::UnsupportedAttribute(name)) if name == "branch"
        ));
    }

    #[test]
    fn rejects_bad_ref_names() {
        for bad in [
            "", "-main", ".hidden", "a..b", "a@{b", "a b", "a\tb", "a^b", "a//b", "a/", "a.lock",
            "a?b", "a*b", "a[b", "a\\b", "a:b",
        ] {
            assert!(validate_ref_name(bad).is_err(), "accepted {:?}", bad);
        }
        for good in ["main", "refs/heads/main", "release-1.0", "feature/x_y", "HEAD"] {
            assert!(validate_ref_name(good).is_ok(), "rejected {:?}", good);
        }
    }

    #[test]
    fn rejects_bad_revisions() {
        assert!(validate_rev(REV).is_ok());
        assert!(validate_rev(&"a".repeat(64)).is_ok());
        assert!(validate_rev("abc123").is_err());
        assert!(validate_rev(&"g".repeat(40)).is_err());
    }

    #[test]
    fn overrides_require_ref_with_rev() {
        let input = Input::from_url("git+https://example.org/repo.git").unwrap();
        let err = input
            .clone()
            .apply_overrides(None, Some(REV.to_string()))
            .unwrap_err();
        assert!(matches!(err, InputError::RevWithoutRef(_)));

        let locked = input
            .apply_overrides(Some("main".into()), Some(REV.to_string()))
            .unwrap();
        assert_eq!(locked.rev.as_deref(), Some(REV));
    }

    #[test]
    fn fingerprint_present_iff_locked() {
        let unlocked = Input::from_url("git+https://example.org/repo.git").unwrap();
        assert!(!unlocked.is_locked());
        assert_eq!(unlocked.fingerprint(), None);

        let locked = Input::from_url(&format!(
            "git+https://example.org/repo.git?ref=main&rev={REV}&submodules=1"
        ))
        .unwrap();
        assert!(locked.is_locked());
        assert_eq!(locked.fingerprint(), Some(format!("{REV};1")));
    }

    #[test]
    fn attrs_roundtrip() {
        let input = Input::from_url(&format!(
            "git+https://example.org/repo.git?ref=main&rev={REV}&submodules=1"
        ))
        .unwrap();
        let roundtripped = Input::from_attrs(input.to_attrs()).unwrap();
        assert_eq!(input, roundtripped);
    }
}
