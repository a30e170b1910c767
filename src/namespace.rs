use std::{fmt, str::FromStr};

use serde::{de::Error as _, Deserialize, Deserializer};

use crate::error::{Error, Result};

/// The `<database>.<collection>` pair a cursor reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The name of the database.
    pub db: String,

    /// The name of the collection. May itself contain dots.
    pub coll: String,
}

impl Namespace {
    /// Construct a `Namespace` with the given database and collection.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Splits `s` on its first dot. Returns `None` if either half would be empty.
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Some(Self::new(db, coll)),
            _ => None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
            .ok_or_else(|| Error::invalid_argument(format!("invalid namespace \"{s}\"")))
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| D::Error::custom(format!("invalid namespace \"{s}\"")))
    }
}

#[cfg(test)]
mod test {
    use super::Namespace;

    #[test]
    fn parse_splits_on_first_dot() {
        let ns = Namespace::parse("db.coll.with.dots").unwrap();
        assert_eq!(ns, Namespace::new("db", "coll.with.dots"));
        assert_eq!(ns.to_string(), "db.coll.with.dots");

        assert!(Namespace::parse("db").is_none());
        assert!(Namespace::parse("db.").is_none());
        assert!(Namespace::parse(".coll").is_none());
        assert!("nodot".parse::<Namespace>().is_err());
    }
}
