// Multi-hop visibility: with relay enabled on the middle node, a plugin
// announced by one peer is callable from another peer that never connected
// to its owner directly.

use std::collections::HashMap;
use std::time::Duration;

use plexus::{
    BackendConfig, FunctionSpec, ParamSpec, PlexusError, Plexus, Settings, Value,
};

fn test_settings(seed: &str, relay: bool) -> Settings {
    Settings {
        node_seed: Some(seed.to_string()),
        ack_timeout_secs: 2,
        allow_network_relay: relay,
        discovery_path: std::env::temp_dir().join(format!("plexus_test_{}.json", seed)),
        ..Settings::default()
    }
}

async fn hub(seed: &str, relay: bool) -> (Plexus, u16) {
    let system = Plexus::new(test_settings(seed, relay));
    system
        .start(BackendConfig::Thread { workers: 2 })
        .await
        .unwrap();
    let port = system.start_server(0, false).await.unwrap();
    (system, port)
}

async fn spoke_with_plugin(seed: &str, port: u16, plugin: &str, function: &str) -> Plexus {
    let system = Plexus::new(test_settings(seed, true));
    let owner = plugin.to_string();
    system
        .register_sync(
            plugin,
            FunctionSpec::new(function).param(ParamSpec::required("x")),
            move |_ctx, args, _kwargs| {
                let x = args[0].as_int().unwrap_or(0);
                Ok(Value::Str(format!("{}:{}", owner, x * 3)))
            },
        )
        .unwrap();
    system
        .start(BackendConfig::Thread { workers: 1 })
        .await
        .unwrap();
    system.connect_client("127.0.0.1", port, false).await.unwrap();
    system
}

#[tokio::test]
async fn relayed_plugins_are_visible_and_callable_through_the_hub() {
    let (hub_system, port) = hub("relay-hub", true).await;
    let owner = spoke_with_plugin("relay-owner", port, "bmath", "triple").await;

    let caller = Plexus::new(test_settings("relay-caller", true));
    caller
        .start(BackendConfig::Thread { workers: 1 })
        .await
        .unwrap();
    caller.connect_client("127.0.0.1", port, false).await.unwrap();

    // The owner's plugin arrived through the hub during the handshake.
    let entry = caller.registry().resolve("triple", None).unwrap();
    assert!(entry.origin.contains(plexus::OriginFlags::REMOTE));
    assert!(entry.origin.contains(plexus::OriginFlags::INDIRECT));

    // Calling it takes two hops: caller -> hub -> owner.
    let result = caller
        .invoke("triple", None, vec![Value::Int(14)], HashMap::new())
        .await
        .unwrap();
    assert_eq!(result, Value::Str("bmath:42".into()));

    caller.shutdown().await;
    owner.shutdown().await;
    hub_system.shutdown().await;
}

#[tokio::test]
async fn relay_disabled_keeps_remote_plugins_private() {
    let (hub_system, port) = hub("norelay-hub", false).await;
    let owner = spoke_with_plugin("norelay-owner", port, "cmath", "quadruple").await;

    let caller = Plexus::new(test_settings("norelay-caller", true));
    caller
        .start(BackendConfig::Thread { workers: 1 })
        .await
        .unwrap();
    caller.connect_client("127.0.0.1", port, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    match caller.registry().resolve("quadruple", None) {
        Err(PlexusError::FunctionNotFound(_)) => {}
        other => panic!("expected FunctionNotFound, got {:?}", other.is_ok()),
    }

    caller.shutdown().await;
    owner.shutdown().await;
    hub_system.shutdown().await;
}
