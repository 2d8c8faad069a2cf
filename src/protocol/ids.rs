//! Opaque identifiers carried on the relay wire.
//!
//! Both identifiers are generated locally from a fast, non-cryptographic
//! UUID v4. They only need to be unique, not unpredictable: the relay
//! authenticates with the access token, not with these ids.

use std::{fmt, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::error::Error;

/// Identifier of a reliable outbound message, echoed back by the relay in
/// `ACK` and `NACK`.
///
/// Generated once per logical send; retries reuse it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct MessageId(String);

/// Identifier of a live set on the relay.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct SessionId(String);

/// Generates the hyphenated form of a random UUID v4 using `fastrand`.
fn fast_v4() -> String {
    let random_bytes = fastrand::u128(..).to_ne_bytes();
    uuid::Builder::from_random_bytes(random_bytes)
        .into_uuid()
        .hyphenated()
        .to_string()
}

impl MessageId {
    #[must_use]
    pub fn generate() -> Self {
        Self(fast_v4())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SessionId {
    /// Prefix that makes set identifiers recognizable in relay logs.
    const PREFIX: &'static str = "set_";

    #[must_use]
    pub fn generate() -> Self {
        Self(format!("{}{}", Self::PREFIX, fast_v4()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! opaque_string {
    ($($ty:ident),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            /// Accepts any non-empty string: the relay may echo ids that
            /// another client generated.
            impl FromStr for $ty {
                type Err = Error;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    if s.is_empty() {
                        return Err(Error::invalid_argument(concat!(
                            stringify!($ty),
                            " should not be empty"
                        )));
                    }
                    Ok(Self(s.to_owned()))
                }
            }
        )*
    };
}

opaque_string!(MessageId, SessionId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn generated_message_id_is_a_uuid() {
        let id = MessageId::generate();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn empty_ids_are_rejected() {
        assert!("".parse::<MessageId>().is_err());
        assert!(serde_json::from_str::<SessionId>("\"\"").is_err());
        assert_eq!(
            serde_json::from_str::<SessionId>("\"set_abc\"").unwrap().as_str(),
            "set_abc"
        );
    }
}
