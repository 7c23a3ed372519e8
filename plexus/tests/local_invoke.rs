use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plexus::{
    BackendConfig, FunctionSpec, ParamSpec, PlexusError, Plexus, Scope, Settings, Value,
};

fn test_settings(seed: &str) -> Settings {
    Settings {
        node_seed: Some(seed.to_string()),
        ..Settings::default()
    }
}

async fn started_system(seed: &str, workers: usize) -> Plexus {
    let system = Plexus::new(test_settings(seed));
    system
        .start(BackendConfig::Thread { workers })
        .await
        .unwrap();
    system
}

#[tokio::test]
async fn registered_function_is_invocable() {
    let system = Plexus::new(test_settings("local-1"));
    system
        .register_sync(
            "math",
            FunctionSpec::new("double").param(ParamSpec::required("x").typed("int")),
            |_ctx, args, _kwargs| Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2)),
        )
        .unwrap();
    system.start(BackendConfig::Thread { workers: 2 }).await.unwrap();

    let result = system
        .invoke("double", None, vec![Value::Int(21)], HashMap::new())
        .await
        .unwrap();
    assert_eq!(result, Value::Int(42));
    system.shutdown().await;
}

#[tokio::test]
async fn registration_after_start_fails() {
    let system = started_system("local-2", 1).await;
    let err = system
        .register_sync("late", FunctionSpec::new("f"), |_ctx, _a, _k| Ok(Value::Null))
        .unwrap_err();
    assert!(matches!(err, PlexusError::AlreadyStarted));
    system.shutdown().await;
}

#[tokio::test]
async fn unknown_and_ambiguous_names() {
    let system = Plexus::new(test_settings("local-3"));
    for plugin in ["alpha", "beta"] {
        system
            .register_sync(plugin, FunctionSpec::new("run"), move |_ctx, _a, _k| {
                Ok(Value::Str(plugin.to_string()))
            })
            .unwrap();
    }
    system.start(BackendConfig::Thread { workers: 1 }).await.unwrap();

    match system.invoke("missing", None, vec![], HashMap::new()).await {
        Err(PlexusError::FunctionNotFound(_)) => {}
        other => panic!("expected FunctionNotFound, got {:?}", other.map(|v| v.to_string())),
    }
    match system.invoke("run", None, vec![], HashMap::new()).await {
        Err(PlexusError::AmbiguousFunction(name)) => assert_eq!(name, "run"),
        other => panic!("expected ambiguity, got {:?}", other.map(|v| v.to_string())),
    }
    let result = system
        .invoke("run", Some("beta"), vec![], HashMap::new())
        .await
        .unwrap();
    assert_eq!(result, Value::Str("beta".into()));
    system.shutdown().await;
}

#[tokio::test]
async fn queue_overflow_is_fail_fast() {
    let mut settings = test_settings("local-4");
    settings.max_queue = 2;
    let system = Plexus::new(settings);
    system
        .register_sync("slow", FunctionSpec::new("nap"), |_ctx, _a, _k| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(Value::Null)
        })
        .unwrap();
    system.start(BackendConfig::Thread { workers: 1 }).await.unwrap();

    let mut futures = Vec::new();
    for _ in 0..2 {
        let (future, _) = system
            .invoke_future("nap", None, vec![], HashMap::new())
            .await
            .unwrap();
        futures.push(future.unwrap());
    }
    match system.invoke_future("nap", None, vec![], HashMap::new()).await {
        Err(PlexusError::QueueOverflow(msg)) => assert!(msg.contains("no available workers")),
        other => panic!("expected QueueOverflow, got {:?}", other.is_ok()),
    }
    for future in futures {
        future.wait().await.unwrap();
    }
    system.shutdown().await;
}

#[tokio::test]
async fn async_functions_run_on_the_scheduler() {
    let system = Plexus::new(test_settings("local-5"));
    system
        .register_async(
            "aio",
            FunctionSpec::new("delayed_echo").param(ParamSpec::required("text")),
            |_ctx, args, _kwargs| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(args.into_iter().next().unwrap_or(Value::Null))
                })
            },
        )
        .unwrap();
    system.start(BackendConfig::Thread { workers: 1 }).await.unwrap();

    let result = system
        .invoke("delayed_echo", None, vec![Value::Str("hi".into())], HashMap::new())
        .await
        .unwrap();
    assert_eq!(result, Value::Str("hi".into()));
    system.shutdown().await;
}

#[tokio::test]
async fn oneway_local_calls_run_detached() {
    let system = Plexus::new(test_settings("local-6"));
    let ran = Arc::new(AtomicBool::new(false));
    let ran_handler = ran.clone();
    system
        .register_sync("side", FunctionSpec::new("touch"), move |_ctx, _a, _k| {
            ran_handler.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        })
        .unwrap();
    system.start(BackendConfig::Thread { workers: 1 }).await.unwrap();

    system
        .invoke_oneway("touch", None, vec![], HashMap::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ran.load(Ordering::SeqCst));
    system.shutdown().await;
}

#[tokio::test]
async fn signature_validation_guards_calls() {
    let system = Plexus::new(test_settings("local-7"));
    system
        .register_sync(
            "math",
            FunctionSpec::new("power")
                .param(ParamSpec::required("base"))
                .param(ParamSpec::required("exp").with_default(Value::Int(2))),
            |_ctx, args, kwargs| {
                let base = args[0].as_int().unwrap_or(0);
                let exp = kwargs
                    .get("exp")
                    .or(args.get(1))
                    .and_then(|v| v.as_int())
                    .unwrap_or(2);
                Ok(Value::Int(base.pow(exp as u32)))
            },
        )
        .unwrap();
    system.start(BackendConfig::Thread { workers: 1 }).await.unwrap();

    // Defaulted parameter may be omitted.
    let result = system
        .invoke("power", None, vec![Value::Int(3)], HashMap::new())
        .await
        .unwrap();
    assert_eq!(result, Value::Int(9));

    // Missing required parameter is rejected before dispatch.
    match system.invoke("power", None, vec![], HashMap::new()).await {
        Err(PlexusError::SignatureMismatch(msg)) => assert!(msg.contains("base")),
        other => panic!("expected SignatureMismatch, got {:?}", other.is_ok()),
    }

    // Unknown keyword is rejected.
    let mut kwargs = HashMap::new();
    kwargs.insert("modulus".to_string(), Value::Int(7));
    match system
        .invoke("power", None, vec![Value::Int(3)], kwargs)
        .await
    {
        Err(PlexusError::SignatureMismatch(msg)) => assert!(msg.contains("modulus")),
        other => panic!("expected SignatureMismatch, got {:?}", other.is_ok()),
    }
    system.shutdown().await;
}

#[tokio::test]
async fn menu_and_tags_follow_scope() {
    let system = Plexus::new(test_settings("local-8"));
    system
        .register_sync(
            "math",
            FunctionSpec::new("double").with_doc("Doubles a number."),
            |_ctx, _a, _k| Ok(Value::Null),
        )
        .unwrap();
    system
        .register_sync("admin", FunctionSpec::new("wipe"), |_ctx, _a, _k| Ok(Value::Null))
        .unwrap();
    system.start(BackendConfig::Thread { workers: 1 }).await.unwrap();
    system
        .set_plugin_tags("admin", vec!["internal".to_string()])
        .unwrap();

    let menu = system.functions_menu(&Scope::all());
    assert!(menu.contains("double()"));
    assert!(menu.contains("Doubles a number."));
    assert!(menu.contains("wipe()"));

    let public = system.functions_menu(&Scope::all().with_exclusive_tags(["internal"]));
    assert!(public.contains("double()"));
    assert!(!public.contains("wipe()"));

    let status = system.status();
    assert!(status.contains("Mode: thread"));
    assert!(status.contains("math"));
    system.shutdown().await;
}
