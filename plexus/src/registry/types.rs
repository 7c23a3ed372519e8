// Descriptor types for the plugin/function directory.
//
// A function's schema is an explicit record supplied at registration time,
// never introspected from a live object; the handler is attached separately
// and never crosses the wire.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use callscript::Value;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::context::ContextHandle;
use crate::errors::PlexusResult;
use crate::network::LinkHandle;

/// Where a plugin (or function) came from, as a bitset. A merged remote
/// plugin carries REMOTE plus the link direction; a plugin learned through a
/// relaying peer additionally carries INDIRECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginFlags(pub u8);

impl OriginFlags {
    pub const LOCAL: OriginFlags = OriginFlags(1);
    pub const REMOTE: OriginFlags = OriginFlags(1 << 1);
    pub const INDIRECT: OriginFlags = OriginFlags(1 << 2);
    pub const SERVER: OriginFlags = OriginFlags(1 << 3);
    pub const CLIENT: OriginFlags = OriginFlags(1 << 4);

    pub fn contains(self, other: OriginFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: OriginFlags) -> OriginFlags {
        OriginFlags(self.0 | other.0)
    }

    pub fn is_local(self) -> bool {
        self.contains(OriginFlags::LOCAL)
    }

    pub fn is_remote(self) -> bool {
        self.contains(OriginFlags::REMOTE)
    }

    /// Remap for export: local plugins become remote on the receiving side,
    /// remote ones become indirect remotes.
    pub fn exported(self) -> OriginFlags {
        if self.is_local() {
            OriginFlags::REMOTE
        } else if self.is_remote() {
            OriginFlags::REMOTE.union(OriginFlags::INDIRECT)
        } else {
            self
        }
    }
}

impl std::ops::BitOr for OriginFlags {
    type Output = OriginFlags;
    fn bitor(self, rhs: OriginFlags) -> OriginFlags {
        self.union(rhs)
    }
}

impl fmt::Display for OriginFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (OriginFlags::LOCAL, "LOCAL"),
            (OriginFlags::REMOTE, "REMOTE"),
            (OriginFlags::INDIRECT, "INDIRECT"),
            (OriginFlags::SERVER, "SERVER"),
            (OriginFlags::CLIENT, "CLIENT"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionKind {
    LocalSync,
    LocalAsync,
    Remote,
}

/// One declared parameter of a function schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: None,
            default: None,
            doc: None,
        }
    }

    pub fn typed(mut self, tag: impl Into<String>) -> Self {
        self.type_tag = Some(tag.into());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
}

/// Explicit call schema: name, typed parameters, defaults, docs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: None,
            params: Vec::new(),
            returns: None,
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_returns(mut self, returns: impl Into<String>) -> Self {
        self.returns = Some(returns.into());
        self
    }

    /// Pseudo-signature used in menus and error messages, e.g.
    /// `search(query: str, limit=10)`.
    pub fn render_signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let mut s = p.name.clone();
                if let Some(tag) = &p.type_tag {
                    s.push_str(": ");
                    s.push_str(tag);
                }
                if let Some(default) = &p.default {
                    s.push_str(" = ");
                    s.push_str(&default.to_string());
                }
                s
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

pub type SyncHandler =
    Arc<dyn Fn(ContextHandle, Vec<Value>, HashMap<String, Value>) -> PlexusResult<Value> + Send + Sync>;

pub type AsyncHandler = Arc<
    dyn Fn(ContextHandle, Vec<Value>, HashMap<String, Value>) -> BoxFuture<'static, PlexusResult<Value>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => write!(f, "Handler::Sync"),
            Handler::Async(_) => write!(f, "Handler::Async"),
        }
    }
}

/// A resolvable function: schema plus dispatch binding.
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub spec: FunctionSpec,
    pub kind: FunctionKind,
    /// Never exported to peers.
    pub local_only: bool,
    pub tags: Vec<String>,
    pub origin: OriginFlags,
    pub plugin_id: String,
    pub plugin_name: String,
    /// Identity of the peer that announced this function, for remote entries.
    pub peer: Option<String>,
    /// Link through which a remote entry is reachable.
    pub link: Option<LinkHandle>,
    /// Present for local entries only.
    pub handler: Option<Handler>,
}

#[derive(Debug, Clone)]
pub struct PluginEntry {
    pub id: String,
    pub name: String,
    pub functions: Vec<FunctionEntry>,
    pub tags: Vec<String>,
    pub origin: OriginFlags,
    pub is_alive: bool,
    pub active_tasks: u32,
    pub peer: Option<String>,
    pub link: Option<LinkHandle>,
}

/// Wire-safe snapshot of a function, as exchanged in handshakes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub spec: FunctionSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub origin: OriginFlags,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local_only: bool,
}

/// Wire-safe snapshot of a plugin, as exchanged in handshakes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSignature {
    pub id: String,
    pub name: String,
    pub functions: Vec<FunctionSignature>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub origin: OriginFlags,
}

impl PluginEntry {
    /// Export snapshot with provenance remapped and local-only functions
    /// stripped. Returns `None` when nothing would remain visible.
    pub fn export_signature(&self) -> Option<PluginSignature> {
        let functions: Vec<FunctionSignature> = self
            .functions
            .iter()
            .filter(|f| !f.local_only)
            .map(|f| FunctionSignature {
                spec: f.spec.clone(),
                tags: f.tags.clone(),
                origin: f.origin.exported(),
                local_only: false,
            })
            .collect();
        if functions.is_empty() {
            return None;
        }
        Some(PluginSignature {
            id: self.id.clone(),
            name: self.name.clone(),
            functions,
            tags: self.tags.clone(),
            origin: self.origin.exported(),
        })
    }
}
