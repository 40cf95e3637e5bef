use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Dotted path identifying a target in the component tree, e.g.
/// `zb08.telescope.rightascension`.
///
/// The address carries a traversal cursor (`index`) counting how many
/// segments have already been consumed on the way down the tree. Equality
/// and hashing ignore the cursor: two addresses pointing at the same target
/// are equal no matter how far each has been routed.
#[derive(Debug, Clone, Default)]
pub struct Address {
    segments: Vec<String>,
    /// Number of segments consumed during traversal.
    pub index: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("address is empty")]
    Empty,
    #[error("address contains an empty segment: {0:?}")]
    EmptySegment(String),
}

impl Address {
    pub fn new(segments: Vec<String>) -> Result<Self, AddressParseError> {
        if segments.is_empty() {
            return Err(AddressParseError::Empty);
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(AddressParseError::EmptySegment(segments.join(".")));
        }
        Ok(Self { segments, index: 0 })
    }

    pub fn parse(path: &str) -> Result<Self, AddressParseError> {
        if path.is_empty() {
            return Err(AddressParseError::Empty);
        }
        let segments: Vec<String> = path.split('.').map(str::to_owned).collect();
        Self::new(segments)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    /// Segment under the cursor, `None` once the address is exhausted.
    pub fn current(&self) -> Option<&str> {
        self.segment(self.index)
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.segments.len()
    }

    /// Consume one segment.
    pub fn advance(&mut self) {
        self.index += 1;
    }

    /// Segments not yet consumed, joined with dots. Used by the access gate
    /// lists and by the hardware adapter.
    pub fn residual(&self) -> String {
        self.segments
            .get(self.index.min(self.segments.len())..)
            .unwrap_or(&[])
            .join(".")
    }

    pub fn residual_segments(&self) -> &[String] {
        self.segments
            .get(self.index.min(self.segments.len())..)
            .unwrap_or(&[])
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.segments == other.segments
    }
}

impl Eq for Address {}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.segments.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl std::str::FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// On the wire an address is its dotted form; the cursor is traversal state
// and never leaves the process.
impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        // Error placeholders for undecodable requests carry an empty
        // address; accept it on the wire even though `parse` rejects it.
        if raw.is_empty() {
            return Ok(Address::default());
        }
        Address::parse(&raw).map_err(serde::de::Error::custom)
    }
}
