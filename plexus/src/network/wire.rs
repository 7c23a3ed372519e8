// Wire message envelope.
//
// Every frame is one MessagePack-encoded map whose `HEAD` field carries the
// header flag bits; the remaining fields are flag-specific and omitted when
// unused, which keeps the encoding compact while staying self-describing.

use std::collections::HashMap;
use std::fmt;

use callscript::Value;
use serde::{Deserialize, Serialize};

use crate::errors::{PlexusError, PlexusResult};
use crate::registry::{PluginSignature, Scope};

/// Protocol revision, exchanged during the handshake. A mismatch is loud in
/// the logs but does not abort the connection.
pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderFlags(pub u32);

impl HeaderFlags {
    pub const ACKNOWLEDGE: HeaderFlags = HeaderFlags(1);
    pub const SERVER: HeaderFlags = HeaderFlags(1 << 1);
    pub const CLIENT: HeaderFlags = HeaderFlags(1 << 2);
    pub const FUNCTION_CALL: HeaderFlags = HeaderFlags(1 << 3);
    pub const FUNCTION_RETURN: HeaderFlags = HeaderFlags(1 << 4);
    pub const EXCEPTION_RETURN: HeaderFlags = HeaderFlags(1 << 5);
    pub const TIME_ESTIMATE_AND_ACK: HeaderFlags = HeaderFlags(1 << 6);
    pub const LOG: HeaderFlags = HeaderFlags(1 << 7);
    pub const FUNCTION_NOT_FOUND: HeaderFlags = HeaderFlags(1 << 8);
    pub const API_CALL: HeaderFlags = HeaderFlags(1 << 9);
    pub const UPDATE_REMOTE_PLUGINS: HeaderFlags = HeaderFlags(1 << 10);

    pub fn contains(self, other: HeaderFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_known(self) -> bool {
        self.0 != 0 && self.0 < (1 << 11)
    }
}

impl std::ops::BitOr for HeaderFlags {
    type Output = HeaderFlags;
    fn bitor(self, rhs: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for HeaderFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (HeaderFlags::ACKNOWLEDGE, "ACKNOWLEDGE"),
            (HeaderFlags::SERVER, "SERVER"),
            (HeaderFlags::CLIENT, "CLIENT"),
            (HeaderFlags::FUNCTION_CALL, "FUNCTION_CALL"),
            (HeaderFlags::FUNCTION_RETURN, "FUNCTION_RETURN"),
            (HeaderFlags::EXCEPTION_RETURN, "EXCEPTION_RETURN"),
            (HeaderFlags::TIME_ESTIMATE_AND_ACK, "TIME_ESTIMATE_AND_ACK"),
            (HeaderFlags::LOG, "LOG"),
            (HeaderFlags::FUNCTION_NOT_FOUND, "FUNCTION_NOT_FOUND"),
            (HeaderFlags::API_CALL, "API_CALL"),
            (HeaderFlags::UPDATE_REMOTE_PLUGINS, "UPDATE_REMOTE_PLUGINS"),
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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "HEAD")]
    pub head: HeaderFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub func_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oneway: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "return")]
    pub return_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_plugin_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_func_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_signatures: Option<HashMap<String, PluginSignature>>,
    /// In a hello, asks the peer to send its signatures back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_signatures: Option<bool>,
    /// Nodes visited so far; relays drop messages exceeding the bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_sig: Option<String>,
}

impl Envelope {
    pub fn new(head: HeaderFlags) -> Self {
        Envelope {
            head,
            ..Envelope::default()
        }
    }

    pub fn encode(&self) -> PlexusResult<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| PlexusError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> PlexusResult<Envelope> {
        rmp_serde::from_slice(bytes).map_err(|e| PlexusError::Codec(e.to_string()))
    }

    pub fn function_call(
        request_id: &str,
        func_name: &str,
        plugin_name: &str,
        plugin_id: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        scope: Scope,
        oneway: bool,
        node_count: u8,
    ) -> Self {
        Envelope {
            request_id: Some(request_id.to_string()),
            func_name: Some(func_name.to_string()),
            plugin_name: Some(plugin_name.to_string()),
            plugin_id: Some(plugin_id.to_string()),
            args: Some(args),
            kwargs: Some(kwargs),
            scope: Some(scope),
            oneway: Some(oneway),
            node_count: Some(node_count),
            ..Envelope::new(HeaderFlags::FUNCTION_CALL)
        }
    }

    pub fn function_return(
        request_id: &str,
        value: Value,
        state: Option<HashMap<String, Value>>,
    ) -> Self {
        Envelope {
            request_id: Some(request_id.to_string()),
            return_value: Some(value),
            state,
            ..Envelope::new(HeaderFlags::FUNCTION_RETURN)
        }
    }

    pub fn exception_return(
        request_id: &str,
        exc_type: &str,
        message: String,
        traceback: String,
        offline_plugin_name: Option<String>,
    ) -> Self {
        Envelope {
            request_id: Some(request_id.to_string()),
            exc_type: Some(exc_type.to_string()),
            message: Some(message),
            traceback: Some(traceback),
            offline_plugin_name,
            ..Envelope::new(HeaderFlags::EXCEPTION_RETURN)
        }
    }

    pub fn time_estimate_ack(request_id: &str, estimate: f64) -> Self {
        Envelope {
            request_id: Some(request_id.to_string()),
            time_estimate: Some(estimate),
            ..Envelope::new(HeaderFlags::TIME_ESTIMATE_AND_ACK)
        }
    }

    pub fn function_not_found(request_id: &str) -> Self {
        Envelope {
            request_id: Some(request_id.to_string()),
            ..Envelope::new(HeaderFlags::FUNCTION_NOT_FOUND)
        }
    }

    pub fn api_call(
        request_id: &str,
        api_func_name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> Self {
        Envelope {
            request_id: Some(request_id.to_string()),
            api_func_name: Some(api_func_name.to_string()),
            args: Some(args),
            kwargs: Some(kwargs),
            ..Envelope::new(HeaderFlags::API_CALL)
        }
    }

    pub fn update_remote_plugins(
        node_id: &str,
        signatures: HashMap<String, PluginSignature>,
    ) -> Self {
        Envelope {
            node_id: Some(node_id.to_string()),
            plugin_signatures: Some(signatures),
            ..Envelope::new(HeaderFlags::UPDATE_REMOTE_PLUGINS | HeaderFlags::SERVER)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_function_call() {
        let mut kwargs = HashMap::new();
        kwargs.insert("limit".to_string(), Value::Int(5));
        let env = Envelope::function_call(
            "req-1",
            "search",
            "knowledge",
            "abc123",
            vec![Value::Str("rust".into())],
            kwargs,
            Scope::all(),
            false,
            1,
        );
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        assert!(back.head.contains(HeaderFlags::FUNCTION_CALL));
        assert_eq!(back.request_id.as_deref(), Some("req-1"));
        assert_eq!(back.func_name.as_deref(), Some("search"));
        assert_eq!(back.args, env.args);
        assert_eq!(back.node_count, Some(1));
    }

    #[test]
    fn envelope_roundtrip_exception() {
        let env = Envelope::exception_return(
            "req-2",
            "ValueError",
            "bad input".into(),
            "trace".into(),
            Some("math".into()),
        );
        let back = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert!(back.head.contains(HeaderFlags::EXCEPTION_RETURN));
        assert_eq!(back.offline_plugin_name.as_deref(), Some("math"));
    }

    #[test]
    fn unused_fields_are_not_encoded() {
        let small = Envelope::function_not_found("x").encode().unwrap();
        let large = Envelope::function_call(
            "x",
            "f",
            "p",
            "id",
            vec![],
            HashMap::new(),
            Scope::all(),
            false,
            0,
        )
        .encode()
        .unwrap();
        assert!(small.len() < large.len());
    }

    #[test]
    fn header_flag_display() {
        let head = HeaderFlags::ACKNOWLEDGE | HeaderFlags::CLIENT;
        assert_eq!(head.to_string(), "ACKNOWLEDGE|CLIENT");
        assert!(head.is_known());
        assert!(!HeaderFlags(1 << 20).is_known());
    }
}
