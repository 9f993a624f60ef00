//! Physical identity of a registered item: a GUID or a storage URL.

use std::fmt;
use std::str::FromStr;

use crate::catalog::{ATTR_GUID, ATTR_SURL, Attribute};
use crate::error::{EdsError, Result};

pub const SURL_PREFIX: &str = "srm://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaId {
    Guid(String),
    /// `srm://` storage URL of one physical copy.
    Surl(String),
}

impl ReplicaId {
    pub fn parse(id: &str) -> Result<Self> {
        let id = id.trim();
        if id.is_empty() {
            return Err(EdsError::InvalidArgument("replica id is empty".into()));
        }
        if id.starts_with(SURL_PREFIX) {
            if id.len() == SURL_PREFIX.len() {
                return Err(EdsError::InvalidArgument(format!("SURL '{id}' names no file")));
            }
            Ok(ReplicaId::Surl(id.to_string()))
        } else {
            Ok(ReplicaId::Guid(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReplicaId::Guid(id) | ReplicaId::Surl(id) => id,
        }
    }

    /// Catalog attribute this identity is stored under.
    pub fn attribute_name(&self) -> &'static str {
        match self {
            ReplicaId::Guid(_) => ATTR_GUID,
            ReplicaId::Surl(_) => ATTR_SURL,
        }
    }

    pub(crate) fn attribute(&self) -> Attribute {
        Attribute::new(self.attribute_name(), self.as_str())
    }
}

impl FromStr for ReplicaId {
    type Err = EdsError;

    fn from_str(s: &str) -> Result<Self> {
        ReplicaId::parse(s)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
