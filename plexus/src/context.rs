// Invocation context: who is calling, what they may see, and where their
// interactive side effects should land.
//
// The context travels explicitly through every call path; there is no
// task-local or global "current invocation".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use callscript::Value;
use tracing::info;

use crate::registry::Scope;

pub type ContextHandle = Arc<CallContext>;

/// Side-effect sink for a running function. Local invocations resolve these
/// immediately; invocations on behalf of a remote caller forward them to the
/// true origin instead of executing them here.
pub trait Effects: Send + Sync {
    fn display(&self, payload: Value);
    fn show_message(&self, level: &str, text: &str);
}

pub struct CallContext {
    pub request_id: String,
    /// Identity of the node the call chain originated from.
    pub origin: String,
    pub scope: Scope,
    /// True when side effects must be relayed rather than executed locally.
    pub is_remote: bool,
    /// Nodes this call chain has already visited.
    pub hops: u8,
    /// Opaque key/value bag carried across the call chain. Process-pool
    /// replies replace keys wholesale; there is no deep-merge contract.
    pub state: Mutex<HashMap<String, Value>>,
    effects: Arc<dyn Effects>,
}

impl CallContext {
    pub fn local(request_id: impl Into<String>, origin: impl Into<String>) -> ContextHandle {
        Arc::new(Self {
            request_id: request_id.into(),
            origin: origin.into(),
            scope: Scope::all(),
            is_remote: false,
            hops: 0,
            state: Mutex::new(HashMap::new()),
            effects: Arc::new(LocalEffects),
        })
    }

    pub fn new(
        request_id: impl Into<String>,
        origin: impl Into<String>,
        scope: Scope,
        is_remote: bool,
        hops: u8,
        state: HashMap<String, Value>,
        effects: Arc<dyn Effects>,
    ) -> ContextHandle {
        Arc::new(Self {
            request_id: request_id.into(),
            origin: origin.into(),
            scope,
            is_remote,
            hops,
            state: Mutex::new(state),
            effects,
        })
    }

    pub fn effects(&self) -> &dyn Effects {
        self.effects.as_ref()
    }

    pub fn state_snapshot(&self) -> HashMap<String, Value> {
        self.state.lock().expect("state lock poisoned").clone()
    }

    pub fn replace_state(&self, state: HashMap<String, Value>) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    pub fn state_get(&self, key: &str) -> Option<Value> {
        self.state.lock().expect("state lock poisoned").get(key).cloned()
    }

    pub fn state_set(&self, key: impl Into<String>, value: Value) {
        self.state
            .lock()
            .expect("state lock poisoned")
            .insert(key.into(), value);
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("request_id", &self.request_id)
            .field("origin", &self.origin)
            .field("is_remote", &self.is_remote)
            .field("hops", &self.hops)
            .finish()
    }
}

/// Maximum-compatibility sink: side effects become log lines on this node.
pub struct LocalEffects;

impl Effects for LocalEffects {
    fn display(&self, payload: Value) {
        info!("display: {}", payload);
    }

    fn show_message(&self, level: &str, text: &str) {
        info!("{}: {}", level.to_uppercase(), text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_bag_replacement_is_wholesale() {
        let ctx = CallContext::local("req", "node");
        ctx.state_set("a", Value::Int(1));
        ctx.state_set("b", Value::Int(2));
        let mut replacement = HashMap::new();
        replacement.insert("a".to_string(), Value::Int(10));
        ctx.replace_state(replacement);
        assert_eq!(ctx.state_get("a"), Some(Value::Int(10)));
        assert_eq!(ctx.state_get("b"), None);
    }
}
