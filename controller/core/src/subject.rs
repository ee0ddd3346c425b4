use serde::{Deserialize, Serialize};

/// Prefix under which internally-issued token subjects are minted. The
/// remainder is a canonical `namespace/kind/name` resource path.
pub const DEFAULT_INTERNAL_PREFIX: &str = "internal:";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Exporter,
    Client,
    Lease,
    Secret,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exporter => "exporter",
            Self::Client => "client",
            Self::Lease => "lease",
            Self::Secret => "secret",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

impl std::str::FromStr for Kind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        match s {
            "exporter" => Ok(Self::Exporter),
            "client" => Ok(Self::Client),
            "lease" => Ok(Self::Lease),
            "secret" => Ok(Self::Secret),
            _ => Err(ParseError(s.to_string())),
        }
    }
}

/// The stable canonical name of a resource, used as a token subject.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub namespace: String,
    pub kind: Kind,
    pub name: String,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid subject {0:?}: expected namespace/kind/name")]
pub struct ParseError(pub String);

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

impl std::str::FromStr for Subject {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let err = || ParseError(s.to_string());

        let mut parts = s.splitn(3, '/');
        let namespace = parts.next().filter(|p| !p.is_empty()).ok_or_else(err)?;
        let kind = parts
            .next()
            .ok_or_else(err)?
            .parse::<Kind>()
            .map_err(|_| err())?;
        let name = parts.next().filter(|p| !p.is_empty()).ok_or_else(err)?;
        Ok(Self {
            namespace: namespace.to_string(),
            kind,
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let subject = Subject {
            namespace: "default".to_string(),
            kind: Kind::Exporter,
            name: "e1".to_string(),
        };
        assert_eq!(subject.to_string(), "default/exporter/e1");
        assert_eq!(subject.to_string().parse::<Subject>().unwrap(), subject);
    }

    #[test]
    fn rejects_malformed() {
        assert!("".parse::<Subject>().is_err());
        assert!("default".parse::<Subject>().is_err());
        assert!("default/exporter".parse::<Subject>().is_err());
        assert!("default/widget/e1".parse::<Subject>().is_err());
        assert!("/exporter/e1".parse::<Subject>().is_err());
    }

    #[test]
    fn name_may_contain_slashes() {
        let s = "default/lease/a/b".parse::<Subject>().unwrap();
        assert_eq!(s.name, "a/b");
    }
}
