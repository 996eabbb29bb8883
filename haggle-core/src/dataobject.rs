//! Data objects, attributes and interests. The session layer treats them as opaque payloads;
//! only the registry looks inside, to match interests and compute ids.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::{bytes_32, write_hex};

/// Weight assumed for interests registered without one.
pub const DEFAULT_WEIGHT: u32 = 1;

/// Interest value that matches any value of the attribute name.
pub const WILDCARD: &str = "*";

/// Name/value pair with a weight. Weight is only meaningful for interests.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
    pub weight: u32,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::weighted(name, value, DEFAULT_WEIGHT)
    }

    pub fn weighted(name: impl Into<String>, value: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            weight,
        }
    }
}

/// Content id: SHA-256 over sorted attributes and the file path.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DataObjectId(#[serde(with = "bytes_32")] [u8; 32]);

impl DataObjectId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        DataObjectId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DataObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0[..8])
    }
}

/// Attributed payload exchanged between application and daemon.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DataObject {
    attributes: Vec<Attribute>,
    file_path: Option<PathBuf>,
}

impl DataObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_attribute(name, value);
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Adds an attribute. An identical name/value pair is not added twice.
    pub fn add_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        self.add(Attribute::new(name, value))
    }

    pub fn add(&mut self, attr: Attribute) -> bool {
        if self
            .attributes
            .iter()
            .any(|a| a.name == attr.name && a.value == attr.value)
        {
            return false;
        }
        self.attributes.push(attr);
        true
    }

    pub fn remove_attribute(&mut self, name: &str, value: &str) -> bool {
        let before = self.attributes.len();
        self.attributes
            .retain(|a| !(a.name == name && a.value == value));
        self.attributes.len() != before
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// No attributes and no file: nothing to hand to an application.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.file_path.is_none()
    }

    pub fn id(&self) -> DataObjectId {
        let mut attrs: Vec<&Attribute> = self.attributes.iter().collect();
        attrs.sort_by(|a, b| (&a.name, &a.value).cmp(&(&b.name, &b.value)));
        let mut hasher = Sha256::new();
        for a in attrs {
            hasher.update((a.name.len() as u32).to_le_bytes());
            hasher.update(a.name.as_bytes());
            hasher.update((a.value.len() as u32).to_le_bytes());
            hasher.update(a.value.as_bytes());
        }
        if let Some(path) = &self.file_path {
            hasher.update(path.to_string_lossy().as_bytes());
        }
        DataObjectId(hasher.finalize().into())
    }

    /// Read the attributes back as interests (interest-list replies carry them this way).
    pub fn interests(&self) -> Vec<Interest> {
        self.attributes
            .iter()
            .map(|a| Interest::weighted(a.name.clone(), a.value.clone(), a.weight))
            .collect()
    }

    pub fn from_interests(interests: &[Interest]) -> Self {
        let mut dobj = DataObject::new();
        for i in interests {
            dobj.add(i.to_attribute());
        }
        dobj
    }
}

/// Attribute-matching criterion registered by an application.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Interest {
    pub name: String,
    pub value: String,
    pub weight: Option<u32>,
}

impl Interest {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            weight: None,
        }
    }

    pub fn weighted(name: impl Into<String>, value: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            weight: Some(weight),
        }
    }

    pub fn effective_weight(&self) -> u32 {
        self.weight.unwrap_or(DEFAULT_WEIGHT)
    }

    /// Same name and value, regardless of weight.
    pub fn same_key(&self, other: &Interest) -> bool {
        self.name == other.name && self.value == other.value
    }

    pub fn matches(&self, attr: &Attribute) -> bool {
        self.name == attr.name && (self.value == WILDCARD || self.value == attr.value)
    }

    pub fn matches_object(&self, dobj: &DataObject) -> bool {
        dobj.attributes().iter().any(|a| self.matches(a))
    }

    pub fn to_attribute(&self) -> Attribute {
        Attribute::weighted(self.name.clone(), self.value.clone(), self.effective_weight())
    }
}
