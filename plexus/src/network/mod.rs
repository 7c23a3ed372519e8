pub mod adapter;
pub mod auth;
mod conn;
pub mod client;
pub mod server;
pub mod wire;

pub use adapter::{LinkHandle, NetAdapter, RemoteEffects};
pub use auth::{create_keypair_files, AuthKeys};
pub use client::{connect_client, ClientHandle};
pub use server::{start_server, ServerHandle};
pub use wire::{Envelope, HeaderFlags, PROTOCOL_VERSION};
