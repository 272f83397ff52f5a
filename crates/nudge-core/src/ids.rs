use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(OperationId, "op");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_id_has_prefix() {
        let id = OperationId::new();
        assert!(id.as_str().starts_with("op_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let ids: Vec<OperationId> = (0..50).map(|_| OperationId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn from_raw_and_parse_agree() {
        let raw = OperationId::from_raw("request_review");
        let parsed: OperationId = "request_review".parse().unwrap();
        assert_eq!(raw, parsed);
        assert_eq!(raw.to_string(), "request_review");
    }
}
