use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Opaque identifier correlating a client's SSE subscription with its POSTs.
///
/// The id is chosen by the client at subscription time and stays stable for
/// the life of the logical connection, including across TCP-level reconnects
/// within the keep-alive window. The server treats it as an opaque string.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a fresh id (UUID v4) for a new client transport.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when parsing an empty client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidClientId;

impl Display for InvalidClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "client id must be non-empty")
    }
}

impl std::error::Error for InvalidClientId {}

impl FromStr for ClientId {
    type Err = InvalidClientId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidClientId);
        }
        Ok(ClientId(s.to_string()))
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        ClientId(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_string())
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<ClientId>()
            .map_err(|_| serde::de::Error::custom("invalid client id"))
    }
}
