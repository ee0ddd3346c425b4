use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A label-equality selector: every listed key must be present with exactly
/// the listed value. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector(BTreeMap<String, String>);

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid label selector {input:?}: {reason}")]
pub struct ParseError {
    pub input: String,
    pub reason: &'static str,
}

impl Selector {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Selector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl std::str::FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let err = |reason| ParseError {
            input: s.to_string(),
            reason,
        };

        let mut labels = BTreeMap::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (k, v) = part.split_once('=').ok_or_else(|| err("expected key=value"))?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() {
                return Err(err("empty label key"));
            }
            if labels.insert(k.to_string(), v.to_string()).is_some() {
                return Err(err("duplicate label key"));
            }
        }
        Ok(Self(labels))
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

impl TryFrom<String> for Selector {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, ParseError> {
        s.parse()
    }
}

impl From<Selector> for String {
    fn from(s: Selector) -> String {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_and_matches() {
        let sel = "board=mock, rack=r1".parse::<Selector>().unwrap();
        assert!(sel.matches(&labels(&[("board", "mock"), ("rack", "r1"), ("x", "y")])));
        assert!(!sel.matches(&labels(&[("board", "mock")])));
        assert!(!sel.matches(&labels(&[("board", "other"), ("rack", "r1")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = "".parse::<Selector>().unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&labels(&[])));
        assert!(sel.matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn rejects_malformed() {
        assert!("board".parse::<Selector>().is_err());
        assert!("=v".parse::<Selector>().is_err());
        assert!("a=1,a=2".parse::<Selector>().is_err());
    }

    #[test]
    fn display_round_trips() {
        let sel = "b=2,a=1".parse::<Selector>().unwrap();
        assert_eq!(sel.to_string(), "a=1,b=2");
        assert_eq!(sel.to_string().parse::<Selector>().unwrap(), sel);
    }
}
