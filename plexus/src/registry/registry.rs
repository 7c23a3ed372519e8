// The plugin/function directory.
//
// One mutex serializes every mutation; reads hand out cloned snapshots so
// concurrent handshakes and executions never observe a partially updated
// table. The name index is derived by scanning the (small) plugin table,
// which keeps it impossible to desynchronize from the source of truth.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tracing::{debug, warn};

use super::scope::Scope;
use super::types::{
    FunctionEntry, FunctionKind, FunctionSpec, Handler, OriginFlags, PluginEntry, PluginSignature,
};
use crate::errors::{PlexusError, PlexusResult};
use crate::identity::NodeIdentity;
use crate::network::LinkHandle;

pub struct PluginRegistry {
    inner: RwLock<HashMap<String, PluginEntry>>,
    /// Set once calls are being accepted; registration is boot-time only.
    started: AtomicBool,
    accept_remote: bool,
    identity: NodeIdentity,
}

impl PluginRegistry {
    pub fn new(identity: NodeIdentity, accept_remote: bool) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            accept_remote,
            identity,
        }
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &str {
        self.identity.id()
    }

    /// Registers a local function, creating its owning plugin on first use.
    pub fn register_local(
        &self,
        plugin_name: &str,
        spec: FunctionSpec,
        kind: FunctionKind,
        local_only: bool,
        handler: Handler,
    ) -> PlexusResult<()> {
        if self.is_started() {
            return Err(PlexusError::AlreadyStarted);
        }
        if matches!(kind, FunctionKind::Remote) {
            return Err(PlexusError::Internal(
                "remote entries are created by handshakes, not registration".to_string(),
            ));
        }
        let mut inner = self.inner.write().unwrap();
        let plugin_id = self.identity.plugin_id(plugin_name);
        let plugin = inner.entry(plugin_id.clone()).or_insert_with(|| PluginEntry {
            id: plugin_id.clone(),
            name: plugin_name.to_string(),
            functions: Vec::new(),
            tags: Vec::new(),
            origin: OriginFlags::LOCAL,
            is_alive: true,
            active_tasks: 0,
            peer: None,
            link: None,
        });
        plugin.functions.push(FunctionEntry {
            spec,
            kind,
            local_only,
            tags: plugin.tags.clone(),
            origin: OriginFlags::LOCAL,
            plugin_id: plugin.id.clone(),
            plugin_name: plugin.name.clone(),
            peer: None,
            link: None,
            handler: Some(handler),
        });
        Ok(())
    }

    /// Exact lookup when the plugin name is given, global search otherwise.
    /// A name matching more than one plugin requires the qualifier.
    pub fn resolve(&self, name: &str, plugin_name: Option<&str>) -> PlexusResult<FunctionEntry> {
        let inner = self.inner.read().unwrap();
        match plugin_name {
            Some(plugin_name) => {
                let plugin = inner
                    .values()
                    .find(|p| p.name == plugin_name)
                    .ok_or_else(|| PlexusError::PluginNotFound(plugin_name.to_string()))?;
                plugin
                    .functions
                    .iter()
                    .find(|f| f.spec.name == name)
                    .cloned()
                    .ok_or_else(|| {
                        PlexusError::FunctionNotFound(format!(
                            "plugin '{}' found, but not function '{}'",
                            plugin_name, name
                        ))
                    })
            }
            None => {
                let matches: Vec<&FunctionEntry> = inner
                    .values()
                    .flat_map(|p| p.functions.iter())
                    .filter(|f| f.spec.name == name)
                    .collect();
                match matches.len() {
                    0 => Err(PlexusError::FunctionNotFound(name.to_string())),
                    1 => Ok(matches[0].clone()),
                    _ => Err(PlexusError::AmbiguousFunction(name.to_string())),
                }
            }
        }
    }

    /// Lookup for an inbound wire call, which addresses by plugin id.
    pub fn get_function(&self, plugin_id: &str, name: &str) -> PlexusResult<FunctionEntry> {
        let inner = self.inner.read().unwrap();
        let plugin = inner
            .get(plugin_id)
            .ok_or_else(|| PlexusError::PluginNotFound(plugin_id.to_string()))?;
        plugin
            .functions
            .iter()
            .find(|f| f.spec.name == name)
            .cloned()
            .ok_or_else(|| PlexusError::FunctionNotFound(name.to_string()))
    }

    pub fn get_plugin(&self, plugin_id: &str) -> Option<PluginEntry> {
        self.inner.read().unwrap().get(plugin_id).cloned()
    }

    pub fn plugin_id_by_name(&self, plugin_name: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .values()
            .find(|p| p.name == plugin_name)
            .map(|p| p.id.clone())
    }

    /// Merges a handshake batch. A local plugin of the same name wins and the
    /// incoming one is dropped with a warning; a plugin re-announcing under a
    /// known id replaces the previous entry. Returns the identity of any
    /// previous connection the re-announcing peer used, so callers can drop
    /// that stale peer entry.
    pub fn merge_remote_plugins(
        &self,
        batch: HashMap<String, PluginSignature>,
        peer_identity: &str,
        link: LinkHandle,
        origin_is_client: bool,
        tags: Option<Vec<String>>,
    ) -> Option<String> {
        if !self.accept_remote {
            return None;
        }
        let direction = if origin_is_client {
            OriginFlags::CLIENT
        } else {
            OriginFlags::SERVER
        };

        let mut inner = self.inner.write().unwrap();
        let local_names: Vec<String> = inner
            .values()
            .filter(|p| p.origin.is_local())
            .map(|p| p.name.clone())
            .collect();

        let mut superseded_peer = None;
        let mut new_names = Vec::new();
        for (id, sig) in batch {
            if local_names.iter().any(|n| n == &sig.name) {
                warn!(
                    "plugin '{}' already exists locally; dropping remote announcement",
                    sig.name
                );
                continue;
            }
            if let Some(previous) = inner.remove(&id) {
                debug!("plugin '{}' updated by peer {}", sig.name, peer_identity);
                superseded_peer = previous.peer;
            } else {
                new_names.push(sig.name.clone());
            }

            let plugin_tags = tags.clone().unwrap_or_else(|| sig.tags.clone());
            let origin = sig.origin.union(direction);
            let functions = sig
                .functions
                .into_iter()
                .map(|f| FunctionEntry {
                    spec: f.spec,
                    kind: FunctionKind::Remote,
                    local_only: f.local_only,
                    tags: plugin_tags.clone(),
                    origin: f.origin.union(direction),
                    plugin_id: id.clone(),
                    plugin_name: sig.name.clone(),
                    peer: Some(peer_identity.to_string()),
                    link: Some(link.clone()),
                    handler: None,
                })
                .collect();
            inner.insert(
                id.clone(),
                PluginEntry {
                    id,
                    name: sig.name,
                    functions,
                    tags: plugin_tags,
                    origin,
                    is_alive: true,
                    active_tasks: 0,
                    peer: Some(peer_identity.to_string()),
                    link: Some(link.clone()),
                },
            );
        }
        if !new_names.is_empty() {
            debug!("received new plugins: {}", new_names.join(", "));
        }
        superseded_peer.filter(|p| p != peer_identity)
    }

    pub fn remove_plugin(&self, plugin_name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.retain(|_, p| p.name != plugin_name);
    }

    /// Snapshot for a handshake or relay push.
    ///
    /// Excludes dead plugins, ids listed in `skip` (already announced by the
    /// requester), anything the requesting peer itself announced (no echo),
    /// and - unless relay is enabled - plugins whose provenance is itself
    /// remote. Provenance is remapped on the copy and local-only functions
    /// are stripped; a plugin with nothing left to export is dropped.
    pub fn exportable_plugins(
        &self,
        requesting_peer: Option<&str>,
        skip: &[String],
        allow_relay: bool,
    ) -> HashMap<String, PluginSignature> {
        let inner = self.inner.read().unwrap();
        let mut out = HashMap::new();
        for (id, plugin) in inner.iter() {
            if skip.iter().any(|s| s == id) {
                continue;
            }
            if !plugin.is_alive {
                continue;
            }
            if plugin.origin.is_remote() && !allow_relay {
                continue;
            }
            if let Some(peer) = requesting_peer {
                if plugin.peer.as_deref() == Some(peer) || plugin.id == peer {
                    continue;
                }
            }
            if let Some(sig) = plugin.export_signature() {
                out.insert(id.clone(), sig);
            }
        }
        out
    }

    /// All functions visible under a scope. Dead plugins never contribute;
    /// force-included plugins bypass every other filter.
    pub fn filtered_functions(&self, scope: &Scope) -> Vec<FunctionEntry> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::new();
        for plugin in inner.values() {
            if scope.is_forced(&plugin.name) {
                continue;
            }
            if !plugin.is_alive {
                continue;
            }
            if !scope.plugin_allowed(&plugin.name) {
                continue;
            }
            for function in &plugin.functions {
                if scope.function_allowed(&function.spec.name, &function.tags) {
                    out.push(function.clone());
                }
            }
        }
        if scope.force_include_plugins.is_some() {
            for plugin in inner.values() {
                if scope.is_forced(&plugin.name) {
                    out.extend(plugin.functions.iter().cloned());
                }
            }
        }
        out
    }

    pub fn filtered_plugins(&self, scope: &Scope) -> Vec<PluginEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .values()
            .filter(|p| p.is_alive)
            .filter(|p| scope.plugin_allowed(&p.name))
            .filter(|p| {
                if let Some(inclusive) = &scope.inclusive_tags {
                    if !p.tags.iter().any(|t| inclusive.contains(t)) {
                        return false;
                    }
                }
                if let Some(exclusive) = &scope.exclusive_tags {
                    if p.tags.iter().any(|t| exclusive.contains(t)) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    pub fn mark_alive(&self, plugin_id: &str, alive: bool) {
        let mut inner = self.inner.write().unwrap();
        if let Some(plugin) = inner.get_mut(plugin_id) {
            if plugin.is_alive != alive {
                debug!(
                    "plugin '{}' marked {}",
                    plugin.name,
                    if alive { "alive" } else { "not alive" }
                );
            }
            plugin.is_alive = alive;
        }
    }

    pub fn mark_alive_by_name(&self, plugin_name: &str, alive: bool) {
        let mut inner = self.inner.write().unwrap();
        for plugin in inner.values_mut() {
            if plugin.name == plugin_name {
                plugin.is_alive = alive;
            }
        }
    }

    pub fn is_alive(&self, plugin_id: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .get(plugin_id)
            .map(|p| p.is_alive)
            .unwrap_or(false)
    }

    pub fn adjust_active_tasks(&self, plugin_id: &str, delta: i32) {
        let mut inner = self.inner.write().unwrap();
        if let Some(plugin) = inner.get_mut(plugin_id) {
            plugin.active_tasks = plugin.active_tasks.saturating_add_signed(delta);
        }
    }

    pub fn set_plugin_tags(&self, plugin_name: &str, tags: Vec<String>) -> PlexusResult<()> {
        let mut inner = self.inner.write().unwrap();
        let plugin = inner
            .values_mut()
            .find(|p| p.name == plugin_name)
            .ok_or_else(|| PlexusError::PluginNotFound(plugin_name.to_string()))?;
        plugin.tags = tags.clone();
        for function in &mut plugin.functions {
            function.tags = tags.clone();
        }
        Ok(())
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .values()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Human-readable plugin table for status output.
    pub fn describe_plugins(&self) -> String {
        let inner = self.inner.read().unwrap();
        let mut out = String::from("Plugin info:\n---------\n");
        let mut plugins: Vec<&PluginEntry> = inner.values().collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));
        for plugin in plugins {
            out.push_str(&format!(
                "{}:\n\tid: {}\n\torigin: {}\n\talive: {}\n\tactive tasks: {}\n",
                plugin.name, plugin.id, plugin.origin, plugin.is_alive, plugin.active_tasks
            ));
            if !plugin.tags.is_empty() {
                out.push_str(&format!("\ttags: {}\n", plugin.tags.join(", ")));
            }
            out.push_str("\tfunctions:\n");
            for function in &plugin.functions {
                out.push_str(&format!("\t\t{}\n", function.spec.render_signature()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use callscript::Value;

    use super::*;
    use crate::registry::ParamSpec;

    fn registry() -> PluginRegistry {
        PluginRegistry::new(NodeIdentity::from_seed("registry-test"), true)
    }

    fn noop() -> Handler {
        Handler::Sync(Arc::new(|_ctx, _args, _kwargs| Ok(Value::Null)))
    }

    fn register(reg: &PluginRegistry, plugin: &str, function: &str, local_only: bool) {
        reg.register_local(
            plugin,
            FunctionSpec::new(function).param(ParamSpec::required("x").with_default(Value::Null)),
            FunctionKind::LocalSync,
            local_only,
            noop(),
        )
        .unwrap();
    }

    #[test]
    fn unique_names_resolve_without_a_qualifier() {
        let reg = registry();
        register(&reg, "math", "double", false);
        register(&reg, "math", "add", false);
        assert_eq!(reg.resolve("double", None).unwrap().plugin_name, "math");
        assert_eq!(
            reg.resolve("double", Some("math")).unwrap().spec.name,
            "double"
        );
    }

    #[test]
    fn duplicated_names_require_a_qualifier() {
        let reg = registry();
        register(&reg, "alpha", "run", false);
        register(&reg, "beta", "run", false);
        assert!(matches!(
            reg.resolve("run", None),
            Err(PlexusError::AmbiguousFunction(_))
        ));
        assert_eq!(reg.resolve("run", Some("beta")).unwrap().plugin_name, "beta");
        assert!(matches!(
            reg.resolve("run", Some("gamma")),
            Err(PlexusError::PluginNotFound(_))
        ));
        assert!(matches!(
            reg.resolve("walk", Some("beta")),
            Err(PlexusError::FunctionNotFound(_))
        ));
    }

    #[test]
    fn registration_is_boot_time_only() {
        let reg = registry();
        register(&reg, "math", "double", false);
        reg.mark_started();
        let err = reg
            .register_local(
                "late",
                FunctionSpec::new("f"),
                FunctionKind::LocalSync,
                false,
                noop(),
            )
            .unwrap_err();
        assert!(matches!(err, PlexusError::AlreadyStarted));
    }

    #[test]
    fn export_strips_local_only_and_drops_empty_plugins() {
        let reg = registry();
        register(&reg, "mixed", "public_fn", false);
        register(&reg, "mixed", "private_fn", true);
        register(&reg, "hidden", "secret_fn", true);

        let exported = reg.exportable_plugins(None, &[], false);
        assert_eq!(exported.len(), 1);
        let mixed = exported.values().next().unwrap();
        assert_eq!(mixed.name, "mixed");
        assert_eq!(mixed.functions.len(), 1);
        assert_eq!(mixed.functions[0].spec.name, "public_fn");
        // Provenance is remapped on the copy, not in the registry.
        assert!(mixed.origin.is_remote());
        assert!(reg.get_plugin(&mixed.id).unwrap().origin.is_local());
    }

    #[test]
    fn export_skips_dead_and_already_announced_plugins() {
        let reg = registry();
        register(&reg, "math", "double", false);
        register(&reg, "data", "head", false);
        let math_id = reg.plugin_id_by_name("math").unwrap();

        reg.mark_alive(&math_id, false);
        let exported = reg.exportable_plugins(None, &[], false);
        assert_eq!(exported.len(), 1);
        assert!(exported.values().all(|p| p.name == "data"));

        reg.mark_alive(&math_id, true);
        let exported = reg.exportable_plugins(None, &[math_id.clone()], false);
        assert!(exported.values().all(|p| p.name == "data"));
    }

    #[test]
    fn forced_plugins_bypass_filters_without_duplication() {
        let reg = registry();
        register(&reg, "math", "double", false);
        register(&reg, "admin", "wipe", false);

        let scope = Scope::all()
            .exclude_plugins(["admin"])
            .force_include(["admin"]);
        let names: Vec<String> = reg
            .filtered_functions(&scope)
            .into_iter()
            .map(|f| f.spec.name)
            .collect();
        assert_eq!(names.iter().filter(|n| n.as_str() == "wipe").count(), 1);
        assert!(names.contains(&"double".to_string()));

        // Forcing a plugin that already passes the filters adds it once.
        let scope = Scope::all().force_include(["math"]);
        let names: Vec<String> = reg
            .filtered_functions(&scope)
            .into_iter()
            .map(|f| f.spec.name)
            .collect();
        assert_eq!(names.iter().filter(|n| n.as_str() == "double").count(), 1);
    }

    #[test]
    fn dead_plugins_never_contribute_functions() {
        let reg = registry();
        register(&reg, "math", "double", false);
        let math_id = reg.plugin_id_by_name("math").unwrap();
        reg.mark_alive(&math_id, false);
        assert!(reg.filtered_functions(&Scope::all()).is_empty());
        assert!(matches!(
            reg.resolve("double", None),
            Ok(entry) if entry.plugin_name == "math"
        ));
    }
}
