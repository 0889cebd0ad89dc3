//! Package versions and version constraints.

use std::fmt;

/// A `major.minor.patch` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `1`, `1.2` or `1.2.3`; missing parts are zero.
    pub fn parse(text: &str) -> Result<Self, String> {
        parse_partial(text).map(|(version, _)| version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl TryFrom<String> for Version {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Version::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

fn parse_partial(text: &str) -> Result<(Version, usize), String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty version".to_string());
    }
    let mut numbers = [0u64; 3];
    let mut count = 0;
    for part in text.split('.') {
        if count == 3 {
            return Err(format!("`{}` has more than three components", text));
        }
        numbers[count] = part
            .parse()
            .map_err(|_| format!("`{}` is not a valid version", text))?;
        count += 1;
    }
    Ok((Version::new(numbers[0], numbers[1], numbers[2]), count))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Exact,
    Caret,
    Tilde,
    Greater,
    GreaterEq,
    Less,
    LessEq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: Version,
    /// How many of major/minor/patch were written.
    parts: usize,
}

impl Comparator {
    fn matches(&self, v: &Version) -> bool {
        let base = &self.version;
        match self.op {
            Op::Exact => match self.parts {
                1 => v.major == base.major,
                2 => v.major == base.major && v.minor == base.minor,
                _ => v == base,
            },
            Op::Greater => v > base,
            Op::GreaterEq => v >= base,
            Op::Less => v < base,
            Op::LessEq => v <= base,
            Op::Tilde => v >= base && v < &self.tilde_upper(),
            Op::Caret => v >= base && v < &self.caret_upper(),
        }
    }

    fn tilde_upper(&self) -> Version {
        let base = &self.version;
        match self.parts {
            1 => Version::new(base.major + 1, 0, 0),
            _ => Version::new(base.major, base.minor + 1, 0),
        }
    }

    fn caret_upper(&self) -> Version {
        let base = &self.version;
        if base.major > 0 || self.parts == 1 {
            Version::new(base.major + 1, 0, 0)
        } else if base.minor > 0 || self.parts == 2 {
            Version::new(0, base.minor + 1, 0)
        } else {
            Version::new(0, 0, base.patch + 1)
        }
    }
}

/// A version constraint such as `^1.2`, `~1.2.3`, `>=1.0, <2.0` or `*`.
///
/// A bare version is a caret constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReq {
    comparators: Vec<Comparator>,
}

impl VersionReq {
    /// Matches every version.
    pub fn any() -> Self {
        Self {
            comparators: Vec::new(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() || text == "*" {
            return Ok(Self::any());
        }

        let mut comparators = Vec::new();
        for part in text.split(',') {
            let part = part.trim();
            let (op, rest) = if let Some(rest) = part.strip_prefix(">=") {
                (Op::GreaterEq, rest)
            } else if let Some(rest) = part.strip_prefix("<=") {
                (Op::LessEq, rest)
            } else if let Some(rest) = part.strip_prefix('>') {
                (Op::Greater, rest)
            } else if let Some(rest) = part.strip_prefix('<') {
                (Op::Less, rest)
            } else if let Some(rest) = part.strip_prefix('=') {
                (Op::Exact, rest)
            } else if let Some(rest) = part.strip_prefix('^') {
                (Op::Caret, rest)
            } else if let Some(rest) = part.strip_prefix('~') {
                (Op::Tilde, rest)
            } else if part == "*" {
                continue;
            } else {
                (Op::Caret, part)
            };
            let (version, parts) = parse_partial(rest)?;
            comparators.push(Comparator { op, version, parts });
        }

        Ok(Self { comparators })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }
}

impl Default for VersionReq {
    fn default() -> Self {
        Self::any()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    fn req(text: &str) -> VersionReq {
        VersionReq::parse(text).unwrap()
    }

    #[test]
    fn test_version_parse_and_order() {
        assert_eq!(v("1"), Version::new(1, 0, 0));
        assert_eq!(v("1.2.3").to_string(), "1.2.3");
        assert!(v("1.10.0") > v("1.9.9"));
        assert!(Version::parse("1.2.3.4").is_err());
        assert!(Version::parse("one").is_err());
    }

    #[test]
    fn test_caret() {
        assert!(req("^1.2").matches(&v("1.9.0")));
        assert!(!req("^1.2").matches(&v("2.0.0")));
        assert!(!req("^1.2").matches(&v("1.1.9")));
        assert!(req("1.2").matches(&v("1.2.0")));
        assert!(!req("^0.2.3").matches(&v("0.3.0")));
        assert!(!req("^0.0.3").matches(&v("0.0.4")));
    }

    #[test]
    fn test_tilde_exact_and_ranges() {
        assert!(req("~1.2.3").matches(&v("1.2.9")));
        assert!(!req("~1.2.3").matches(&v("1.3.0")));
        assert!(req("=1.2").matches(&v("1.2.7")));
        assert!(!req("=1.2.3").matches(&v("1.2.4")));
        assert!(req(">=1.0, <2.0").matches(&v("1.5.0")));
        assert!(!req(">=1.0, <2.0").matches(&v("2.0.0")));
        assert!(req("*").matches(&v("0.0.1")));
    }

    #[test]
    fn test_invalid_constraints() {
        assert!(VersionReq::parse("not a version").is_err());
        assert!(VersionReq::parse(">=1.x").is_err());
    }

    #[test]
    fn test_version_serde() {
        let parsed: Version = serde_json::from_str("\"2.1\"").unwrap();
        assert_eq!(parsed, Version::new(2, 1, 0));
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"2.1.0\"");
    }
}
