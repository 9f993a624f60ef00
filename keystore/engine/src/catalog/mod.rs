//! Per-endpoint access to the metadata catalog.
//!
//! A [`CatalogBinding`] is the wire transport to one kind of catalog service.
//! [`CatalogAdapter`] sits on top: it addresses one endpoint per call, decodes
//! service exceptions through an [`ExceptionDecoder`], and scopes every error
//! to the endpoint that produced it.

pub mod file;
pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EdsError, FaultKind, Result};

/// Schema tag every share entry is created with.
pub const SCHEMA: &str = "eds";

pub const ATTR_IV: &str = "edsiv";
pub const ATTR_KEY: &str = "edskey";
pub const ATTR_CIPHER: &str = "edscipher";
pub const ATTR_KEYINFO: &str = "edskeyinfo";
pub const ATTR_KEYS_NEEDED: &str = "edskeysneeded";
pub const ATTR_KEY_INDEX: &str = "edskeyindex";

/// Replica identity recorded at the primary endpoint, one of the two.
pub const ATTR_GUID: &str = "edsguid";
pub const ATTR_SURL: &str = "edssurl";

/// Attribute names of a share record, in the order retrieval asks for them.
pub const SHARE_ATTRIBUTES: [&str; 6] = [
    ATTR_IV,
    ATTR_KEY,
    ATTR_CIPHER,
    ATTR_KEYINFO,
    ATTR_KEYS_NEEDED,
    ATTR_KEY_INDEX,
];

/// One named attribute. `None` means absent, which is not the same as "".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl Attribute {
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Attribute {
            name: name.to_string(),
            value: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogOp {
    CreateEntry,
    SetAttributes,
    GetAttributes,
    RemoveEntry,
}

impl CatalogOp {
    /// Service method name, used in decoded error messages.
    pub fn method(&self) -> &'static str {
        match self {
            CatalogOp::CreateEntry => "createEntry",
            CatalogOp::SetAttributes => "setAttributes",
            CatalogOp::GetAttributes => "getAttributes",
            CatalogOp::RemoveEntry => "removeEntry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRequest {
    CreateEntry { item: String, schema: String },
    SetAttributes { item: String, attributes: Vec<Attribute> },
    GetAttributes { item: String, names: Vec<String> },
    RemoveEntry { item: String },
}

impl CatalogRequest {
    pub fn op(&self) -> CatalogOp {
        match self {
            CatalogRequest::CreateEntry { .. } => CatalogOp::CreateEntry,
            CatalogRequest::SetAttributes { .. } => CatalogOp::SetAttributes,
            CatalogRequest::GetAttributes { .. } => CatalogOp::GetAttributes,
            CatalogRequest::RemoveEntry { .. } => CatalogOp::RemoveEntry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogReply {
    Done,
    Attributes(Vec<Attribute>),
}

/// Raw fault as a binding receives it from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFault {
    pub kind: FaultKind,
    pub message: Option<String>,
}

impl ServiceFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        ServiceFault {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn bare(kind: FaultKind) -> Self {
        ServiceFault { kind, message: None }
    }
}

/// Transport to one kind of catalog service. A fresh request context is
/// bound to `endpoint` on every call.
#[async_trait]
pub trait CatalogBinding: Send + Sync {
    async fn invoke(&self, endpoint: &str, request: CatalogRequest) -> std::result::Result<CatalogReply, ServiceFault>;
}

/// Turns a binding's fault into the kind and message callers see.
pub trait ExceptionDecoder: Send + Sync {
    fn decode(&self, method: &str, fault: &ServiceFault) -> (FaultKind, String);
}

/// Decoder for services that report the standard catalog exceptions.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardExceptionDecoder;

impl ExceptionDecoder for StandardExceptionDecoder {
    fn decode(&self, method: &str, fault: &ServiceFault) -> (FaultKind, String) {
        let message = match fault.message.as_deref() {
            Some(msg) if !msg.is_empty() => format!("{method}: {msg}"),
            _ => format!("{method}: {} received from the service", fault.kind.exception_name()),
        };
        (fault.kind, message)
    }
}

#[derive(Clone)]
pub struct CatalogAdapter {
    binding: Arc<dyn CatalogBinding>,
    decoder: Arc<dyn ExceptionDecoder>,
}

impl CatalogAdapter {
    pub fn new(binding: Arc<dyn CatalogBinding>) -> Self {
        Self::with_decoder(binding, Arc::new(StandardExceptionDecoder))
    }

    pub fn with_decoder(binding: Arc<dyn CatalogBinding>, decoder: Arc<dyn ExceptionDecoder>) -> Self {
        CatalogAdapter { binding, decoder }
    }

    async fn call(&self, endpoint: &str, request: CatalogRequest) -> Result<CatalogReply> {
        let method = request.op().method();
        self.binding.invoke(endpoint, request).await.map_err(|fault| {
            let (kind, message) = self.decoder.decode(method, &fault);
            EdsError::Catalog {
                endpoint: endpoint.to_string(),
                kind,
                message,
            }
        })
    }

    pub async fn create_entry(&self, endpoint: &str, item: &str, schema: &str) -> Result<()> {
        self.call(
            endpoint,
            CatalogRequest::CreateEntry {
                item: item.to_string(),
                schema: schema.to_string(),
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn set_attributes(&self, endpoint: &str, item: &str, attributes: &[Attribute]) -> Result<()> {
        self.call(
            endpoint,
            CatalogRequest::SetAttributes {
                item: item.to_string(),
                attributes: attributes.to_vec(),
            },
        )
        .await
        .map(|_| ())
    }

    /// Values for `names`, in the same order; `None` where the attribute is absent.
    pub async fn get_attributes(&self, endpoint: &str, item: &str, names: &[&str]) -> Result<Vec<Option<String>>> {
        let reply = self
            .call(
                endpoint,
                CatalogRequest::GetAttributes {
                    item: item.to_string(),
                    names: names.iter().map(|n| n.to_string()).collect(),
                },
            )
            .await?;

        let CatalogReply::Attributes(attributes) = reply else {
            return Err(EdsError::Catalog {
                endpoint: endpoint.to_string(),
                kind: FaultKind::Protocol,
                message: "getAttributes: reply carried no attributes".into(),
            });
        };

        Ok(names
            .iter()
            .map(|name| {
                attributes
                    .iter()
                    .find(|a| a.name == *name && a.value.is_some())
                    .and_then(|a| a.value.clone())
            })
            .collect())
    }

    pub async fn remove_entry(&self, endpoint: &str, item: &str) -> Result<()> {
        self.call(endpoint, CatalogRequest::RemoveEntry { item: item.to_string() })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_prefixes_method_and_falls_back_to_exception_name() {
        let decoder = StandardExceptionDecoder;

        let (kind, msg) = decoder.decode("removeEntry", &ServiceFault::new(FaultKind::NotExists, "no such item"));
        assert_eq!(kind, FaultKind::NotExists);
        assert_eq!(msg, "removeEntry: no such item");

        let (_, msg) = decoder.decode("createEntry", &ServiceFault::bare(FaultKind::Exists));
        assert_eq!(msg, "createEntry: ExistsException received from the service");
    }
}
