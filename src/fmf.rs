//! FMF/TMT-flavoured test metadata model.
//!
//! Parsing an on-disk FMF tree is an external concern; this module only
//! defines the shapes the rest of the crate schedules and executes against:
//! a [`Platform`] bucket, per-test metadata with a recognised-key subset and
//! a verbatim extras bag, and [`FmfTests`], the outcome of applying one
//! plan to one metadata tree. It also hosts the human-readable duration
//! parser used both by scheduling and by the executor deadline.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum FmfError {
    #[error("bad duration {0:?}")]
    BadDuration(String),

    #[error("unknown test {0:?}")]
    UnknownTest(String),
}

/// A (distro, arch) bucket tests and provisioners are grouped by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Platform {
    pub distro: String,
    pub arch: String,
}

impl Platform {
    pub fn new(distro: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            distro: distro.into(),
            arch: arch.into(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.distro, self.arch)
    }
}

/// Parsed metadata of one test node.
///
/// Recognised keys get typed fields; everything else is preserved verbatim
/// in `extra` so user-defined metadata survives round trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestMetadata {
    /// Tags; fmf allows both a scalar and a list here.
    #[serde(default, deserialize_with = "string_or_list", skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<String>,

    /// Human-readable run-time budget, e.g. `15m` or `1h 30m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scheduling boost; higher runs earlier.
    #[serde(rename = "extra-priority", default, skip_serializing_if = "is_zero")]
    pub extra_priority: i64,

    /// Per-test environment, applied on top of the plan environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TestMetadata {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag.iter().any(|t| t == tag)
    }

    /// The `duration` value converted to seconds, if present and valid.
    pub fn duration_seconds(&self) -> Option<u64> {
        self.duration
            .as_deref()
            .and_then(|d| duration_to_seconds(d).ok())
    }
}

/// One test selected by a plan: name, metadata, and the directory of its
/// metadata node relative to the tree root (which may differ from the name
/// for virtual tests sharing a directory).
#[derive(Debug, Clone)]
pub struct FmfTest {
    pub name: String,
    pub metadata: TestMetadata,
    pub dir: PathBuf,
}

/// Test metadata selected by one plan from one metadata tree, with the
/// plan-level prepare steps and environment. Immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct FmfTests {
    /// Filesystem root of the metadata tree (uploaded to remotes wholesale).
    pub root: PathBuf,
    /// Packages the plan installs before any test runs.
    pub prepare_pkgs: Vec<String>,
    /// Shell scripts the plan runs before any test runs.
    pub prepare_scripts: Vec<String>,
    /// Plan-level environment, applied to every test.
    pub env: BTreeMap<String, String>,
    tests: BTreeMap<String, FmfTest>,
}

impl FmfTests {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Registers a selected test. Disabled tests are dropped here, matching
    /// plan discovery semantics.
    pub fn insert(&mut self, name: impl Into<String>, metadata: TestMetadata, dir: impl Into<PathBuf>) {
        if !metadata.enabled {
            return;
        }
        let name = name.into();
        let test = FmfTest {
            name: name.clone(),
            metadata,
            dir: dir.into(),
        };
        self.tests.insert(name, test);
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn get(&self, name: &str) -> Result<&FmfTest, FmfError> {
        self.tests
            .get(name)
            .ok_or_else(|| FmfError::UnknownTest(name.to_owned()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tests.keys().map(String::as_str)
    }

    pub fn tests(&self) -> impl Iterator<Item = &FmfTest> {
        self.tests.values()
    }

    /// Tests whose names match `regex` from the start, the way tmt
    /// discovery matches test names.
    pub fn matching<'a>(
        &'a self,
        regex: &'a regex::Regex,
    ) -> impl Iterator<Item = &'a FmfTest> + 'a {
        self.tests.values().filter(move |t| {
            regex
                .find(&t.name)
                .is_some_and(|m| m.start() == 0)
        })
    }

    /// Relative directory of a test's metadata, for upload path building.
    pub fn test_dir(&self, name: &str) -> Result<&Path, FmfError> {
        Ok(&self.get(name)?.dir)
    }
}

/// Converts an FMF duration string to seconds.
///
/// Accepts whitespace-separated terms of `<number>[smhd]`, summed; a bare
/// number means seconds: `"90"` → 90, `"1h 30m"` → 5400.
pub fn duration_to_seconds(duration: &str) -> Result<u64, FmfError> {
    let bad = || FmfError::BadDuration(duration.to_owned());
    let mut total: u64 = 0;
    let mut seen = false;

    for term in duration.split_whitespace() {
        seen = true;
        let (digits, unit) = match term.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => term.split_at(idx),
            None => (term, ""),
        };
        let value: u64 = digits.parse().map_err(|_| bad())?;
        let scale = match unit {
            "" | "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => return Err(bad()),
        };
        total = total
            .checked_add(value.checked_mul(scale).ok_or_else(bad)?)
            .ok_or_else(bad)?;
    }

    if seen { Ok(total) } else { Err(bad()) }
}

fn default_true() -> bool {
    true
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// fmf metadata keys may be written as a scalar or a YAML list; accept both.
fn string_or_list<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(de)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(duration_to_seconds("0").unwrap(), 0);
        assert_eq!(duration_to_seconds("90").unwrap(), 90);
        assert_eq!(duration_to_seconds("15m").unwrap(), 900);
        assert_eq!(duration_to_seconds("2h").unwrap(), 7200);
        assert_eq!(duration_to_seconds("1d").unwrap(), 86400);
        assert_eq!(duration_to_seconds("1h 30m").unwrap(), 5400);
        assert_eq!(duration_to_seconds("1m 30s").unwrap(), 90);

        assert!(duration_to_seconds("").is_err());
        assert!(duration_to_seconds("5x").is_err());
        assert!(duration_to_seconds("m").is_err());
    }

    #[test]
    fn metadata_accepts_scalar_and_list_tags() {
        let scalar: TestMetadata = serde_json::from_value(serde_json::json!({
            "tag": "destructive",
            "duration": "10m",
        }))
        .unwrap();
        assert!(scalar.has_tag("destructive"));
        assert_eq!(scalar.duration_seconds(), Some(600));

        let list: TestMetadata = serde_json::from_value(serde_json::json!({
            "tag": ["snapshottable", "fips"],
            "extra-priority": 7,
            "custom-key": {"nested": true},
        }))
        .unwrap();
        assert!(list.has_tag("fips"));
        assert_eq!(list.extra_priority, 7);
        assert!(list.extra.contains_key("custom-key"));
        assert!(list.enabled);
    }

    #[test]
    fn disabled_tests_are_not_selected() {
        let mut tests = FmfTests::new("/fmf");
        tests.insert(
            "/off/test",
            TestMetadata {
                enabled: false,
                ..TestMetadata::default()
            },
            "off/test",
        );
        tests.insert("/on/test", TestMetadata::default(), "on/test");
        assert_eq!(tests.names().collect::<Vec<_>>(), vec!["/on/test"]);
    }

    #[test]
    fn matching_anchors_at_name_start() {
        let mut tests = FmfTests::new("/fmf");
        tests.insert("/pkgs/install", TestMetadata::default(), "pkgs/install");
        tests.insert("/scan/pkgs", TestMetadata::default(), "scan/pkgs");

        let re = regex::Regex::new("/pkgs/.*").unwrap();
        let names: Vec<_> = tests.matching(&re).map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["/pkgs/install"]);
    }
}
