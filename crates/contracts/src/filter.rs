//! Output modes and skip/allow domain matching
//!
//! Every sink applies the same row-level filter: a question name is either
//! forwarded or counted as skipped, depending on the sink's `OutputMode`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::ContractError;

/// What a sink writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawOutputMode", into = "String")]
pub enum OutputMode {
    /// Sink is switched off
    #[default]
    Disabled,
    /// Every question is forwarded
    Unfiltered,
    /// Questions matching the skip list are dropped
    SkipList,
    /// Only questions matching the allow list are forwarded
    AllowList,
    /// Forward when allowed and not skipped
    Both,
}

impl OutputMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, OutputMode::Disabled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Disabled => "disabled",
            OutputMode::Unfiltered => "unfiltered",
            OutputMode::SkipList => "skip",
            OutputMode::AllowList => "allow",
            OutputMode::Both => "both",
        }
    }

    /// Legacy numeric selector (0..=4)
    pub fn from_index(index: u64) -> Option<Self> {
        match index {
            0 => Some(OutputMode::Disabled),
            1 => Some(OutputMode::Unfiltered),
            2 => Some(OutputMode::SkipList),
            3 => Some(OutputMode::AllowList),
            4 => Some(OutputMode::Both),
            _ => None,
        }
    }

    pub fn uses_skip_list(&self) -> bool {
        matches!(self, OutputMode::SkipList | OutputMode::Both)
    }

    pub fn uses_allow_list(&self) -> bool {
        matches!(self, OutputMode::AllowList | OutputMode::Both)
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<OutputMode> for String {
    fn from(mode: OutputMode) -> Self {
        mode.as_str().to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOutputMode {
    Index(u64),
    Name(String),
}

impl TryFrom<RawOutputMode> for OutputMode {
    type Error = String;

    fn try_from(raw: RawOutputMode) -> Result<Self, Self::Error> {
        match raw {
            RawOutputMode::Index(i) => {
                OutputMode::from_index(i).ok_or_else(|| format!("output mode {i} out of range 0..=4"))
            }
            RawOutputMode::Name(name) => match name.to_ascii_lowercase().as_str() {
                "disabled" | "off" => Ok(OutputMode::Disabled),
                "unfiltered" | "all" => Ok(OutputMode::Unfiltered),
                "skip" | "skip_list" => Ok(OutputMode::SkipList),
                "allow" | "allow_list" => Ok(OutputMode::AllowList),
                "both" => Ok(OutputMode::Both),
                other => Err(format!("unknown output mode '{other}'")),
            },
        }
    }
}

/// How a list entry matches a question name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Whole name
    Fqdn,
    /// Leading characters
    Prefix,
    /// Trailing labels
    Suffix,
}

impl MatchKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "fqdn" => Some(MatchKind::Fqdn),
            "prefix" => Some(MatchKind::Prefix),
            "suffix" => Some(MatchKind::Suffix),
            _ => None,
        }
    }
}

/// A set of domain patterns
///
/// Matching ignores ASCII case and the trailing root dot. Suffix entries
/// match on label boundaries only.
#[derive(Debug, Clone, Default)]
pub struct DomainList {
    fqdn: HashSet<String>,
    suffixes: HashSet<String>,
    prefixes: Vec<String>,
}

impl DomainList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse list content: one `name[,match]` entry per line, `#` comments
    pub fn parse(origin: &str, content: &str) -> Result<Self, ContractError> {
        let mut list = Self::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            list.insert_entry(line)
                .map_err(|msg| ContractError::domain_list(origin, idx + 1, msg))?;
        }
        Ok(list)
    }

    /// Build from inline entries using the same `name[,match]` syntax
    pub fn from_entries<I, S>(entries: I) -> Result<Self, ContractError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::new();
        for (idx, entry) in entries.into_iter().enumerate() {
            list.insert_entry(entry.as_ref().trim())
                .map_err(|msg| ContractError::domain_list("inline", idx + 1, msg))?;
        }
        Ok(list)
    }

    fn insert_entry(&mut self, entry: &str) -> Result<(), String> {
        let (name, kind) = match entry.split_once(',') {
            Some((name, kind)) => (
                name,
                MatchKind::parse(kind).ok_or_else(|| format!("unknown match type '{}'", kind.trim()))?,
            ),
            None => (entry, MatchKind::Fqdn),
        };
        let name = normalize(name);
        if name.is_empty() {
            return Err("empty domain".to_string());
        }
        self.insert(&name, kind);
        Ok(())
    }

    /// Add a pattern
    pub fn insert(&mut self, name: &str, kind: MatchKind) {
        let name = normalize(name);
        match kind {
            MatchKind::Fqdn => {
                self.fqdn.insert(name);
            }
            MatchKind::Suffix => {
                self.suffixes.insert(name);
            }
            MatchKind::Prefix => self.prefixes.push(name),
        }
    }

    /// Merge another list into this one
    pub fn extend(&mut self, other: DomainList) {
        self.fqdn.extend(other.fqdn);
        self.suffixes.extend(other.suffixes);
        self.prefixes.extend(other.prefixes);
    }

    pub fn len(&self) -> usize {
        self.fqdn.len() + self.suffixes.len() + self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether `name` matches any pattern
    pub fn matches(&self, name: &str) -> bool {
        let name = normalize(name);
        if self.fqdn.contains(&name) {
            return true;
        }
        if self.prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            return true;
        }
        if self.suffixes.is_empty() {
            return false;
        }
        let mut rest = name.as_str();
        loop {
            if self.suffixes.contains(rest) {
                return true;
            }
            match rest.split_once('.') {
                Some((_, tail)) if !tail.is_empty() => rest = tail,
                _ => return false,
            }
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Skip and allow lists shared by all sinks
#[derive(Debug, Clone, Default)]
pub struct DomainFilter {
    pub skip: DomainList,
    pub allow: DomainList,
}

impl DomainFilter {
    pub fn new(skip: DomainList, allow: DomainList) -> Self {
        Self { skip, allow }
    }

    /// Decide whether a question row is dropped under `mode`
    pub fn should_skip(&self, mode: OutputMode, name: &str) -> bool {
        match mode {
            OutputMode::Disabled => true,
            OutputMode::Unfiltered => false,
            OutputMode::SkipList => self.skip.matches(name),
            OutputMode::AllowList => !self.allow.matches(name),
            OutputMode::Both => !(self.allow.matches(name) && !self.skip.matches(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> DomainFilter {
        let skip = DomainList::parse(
            "skip.csv",
            "# noisy resolvers\nads.example.com\ntracker,prefix\ncdn.net,suffix\n\n",
        )
        .unwrap();
        let allow = DomainList::from_entries(["example.com,suffix", "cdn.net,suffix"]).unwrap();
        DomainFilter::new(skip, allow)
    }

    #[test]
    fn test_fqdn_match_ignores_case_and_root_dot() {
        let f = filter();
        assert!(f.skip.matches("ADS.example.com."));
        assert!(!f.skip.matches("www.ads.example.com"));
    }

    #[test]
    fn test_suffix_matches_on_label_boundary() {
        let f = filter();
        assert!(f.skip.matches("cdn.net"));
        assert!(f.skip.matches("img.eu.cdn.net."));
        assert!(!f.skip.matches("evilcdn.net"));
    }

    #[test]
    fn test_prefix_match() {
        let f = filter();
        assert!(f.skip.matches("tracker-01.io"));
        assert!(!f.skip.matches("mytracker.io"));
    }

    #[test]
    fn test_skip_mode_returns_true_exactly_on_match() {
        let f = filter();
        for name in ["ads.example.com.", "tracker.x", "a.cdn.net", "good.org", "example.com"] {
            assert_eq!(
                f.should_skip(OutputMode::SkipList, name),
                f.skip.matches(name),
                "{name}"
            );
        }
    }

    #[test]
    fn test_modes() {
        let f = filter();
        assert!(f.should_skip(OutputMode::Disabled, "example.com"));
        assert!(!f.should_skip(OutputMode::Unfiltered, "ads.example.com"));
        assert!(!f.should_skip(OutputMode::AllowList, "www.example.com"));
        assert!(f.should_skip(OutputMode::AllowList, "other.org"));
        // allowed but also skipped
        assert!(f.should_skip(OutputMode::Both, "ads.example.com"));
        assert!(f.should_skip(OutputMode::Both, "x.cdn.net"));
        assert!(!f.should_skip(OutputMode::Both, "www.example.com"));
    }

    #[test]
    fn test_parse_rejects_unknown_match_kind() {
        let err = DomainList::parse("bad.csv", "ok.com\nfoo.com,regex\n").unwrap_err();
        assert!(matches!(err, ContractError::DomainList { line: 2, .. }));
    }

    #[test]
    fn test_output_mode_accepts_names_and_indices() {
        #[derive(Deserialize)]
        struct Wrap {
            mode: OutputMode,
        }
        let w: Wrap = serde_json::from_str(r#"{"mode": 2}"#).unwrap();
        assert_eq!(w.mode, OutputMode::SkipList);
        let w: Wrap = serde_json::from_str(r#"{"mode": "Both"}"#).unwrap();
        assert_eq!(w.mode, OutputMode::Both);
        assert!(serde_json::from_str::<Wrap>(r#"{"mode": 9}"#).is_err());
        assert_eq!(serde_json::to_string(&OutputMode::AllowList).unwrap(), "\"allow\"");
    }
}
