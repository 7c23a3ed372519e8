pub mod registry;
pub mod scope;
pub mod types;

pub use registry::PluginRegistry;
pub use scope::{render_menu, Scope};
pub use types::{
    AsyncHandler, FunctionEntry, FunctionKind, FunctionSignature, FunctionSpec, Handler,
    OriginFlags, ParamSpec, PluginEntry, PluginSignature, SyncHandler,
};
