use plexus::{BackendConfig, FunctionSpec, ParamSpec, PlexusError, Plexus, Scope, Settings, Value};

async fn arithmetic_system(seed: &str) -> Plexus {
    let settings = Settings {
        node_seed: Some(seed.to_string()),
        ..Settings::default()
    };
    let system = Plexus::new(settings);
    system
        .register_sync(
            "math",
            FunctionSpec::new("add")
                .param(ParamSpec::required("a"))
                .param(ParamSpec::required("b")),
            |_ctx, args, _kwargs| {
                Ok(Value::Int(
                    args[0].as_int().unwrap_or(0) + args[1].as_int().unwrap_or(0),
                ))
            },
        )
        .unwrap();
    system
        .register_sync(
            "math",
            FunctionSpec::new("double").param(ParamSpec::required("x")),
            |_ctx, args, _kwargs| Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2)),
        )
        .unwrap();
    system
        .register_sync(
            "secrets",
            FunctionSpec::new("reveal"),
            |_ctx, _args, _kwargs| Ok(Value::Str("classified".into())),
        )
        .unwrap();
    system
        .start(BackendConfig::Thread { workers: 2 })
        .await
        .unwrap();
    system
}

#[tokio::test]
async fn chained_program_returns_last_call_result() {
    let system = arithmetic_system("code-1").await;
    let result = system
        .execute_code("v = add(2, 3)\ndouble(v)", Scope::all(), None)
        .await
        .unwrap();
    assert_eq!(result, Value::Int(10));
    system.shutdown().await;
}

#[tokio::test]
async fn unassigned_trailing_call_still_wins() {
    let system = arithmetic_system("code-2").await;
    let result = system
        .execute_code("add(1, 1)\nadd(40, 2)", Scope::all(), None)
        .await
        .unwrap();
    assert_eq!(result, Value::Int(42));
    system.shutdown().await;
}

#[tokio::test]
async fn zero_call_programs_raise_no_effect() {
    let system = arithmetic_system("code-3").await;
    match system.execute_code("x = 5\ny = x", Scope::all(), None).await {
        Err(PlexusError::NoEffect(msg)) => assert!(msg.contains("No calls")),
        other => panic!("expected NoEffect, got {:?}", other.is_ok()),
    }
    system.shutdown().await;
}

#[tokio::test]
async fn unknown_function_is_reported() {
    let system = arithmetic_system("code-4").await;
    match system
        .execute_code("launch_missiles(1)", Scope::all(), None)
        .await
    {
        Err(PlexusError::FunctionNotFound(msg)) => assert!(msg.contains("launch_missiles")),
        other => panic!("expected FunctionNotFound, got {:?}", other.is_ok()),
    }
    system.shutdown().await;
}

#[tokio::test]
async fn syntax_errors_surface_as_parse_failures() {
    let system = arithmetic_system("code-5").await;
    match system
        .execute_code("double(add(1, 2))", Scope::all(), None)
        .await
    {
        Err(PlexusError::Parse(_)) => {}
        other => panic!("expected parse error, got {:?}", other.is_ok()),
    }
    system.shutdown().await;
}

#[tokio::test]
async fn scope_hides_functions_from_code() {
    let system = arithmetic_system("code-6").await;
    let scope = Scope::all().exclude_plugins(["secrets"]);
    match system.execute_code("reveal()", scope, None).await {
        Err(PlexusError::FunctionNotFound(_)) => {}
        other => panic!("expected FunctionNotFound, got {:?}", other.is_ok()),
    }
    // The same call succeeds without the exclusion.
    let result = system.execute_code("reveal()", Scope::all(), None).await.unwrap();
    assert_eq!(result, Value::Str("classified".into()));
    system.shutdown().await;
}

#[tokio::test]
async fn keyword_arguments_flow_through_code() {
    let settings = Settings {
        node_seed: Some("code-7".to_string()),
        ..Settings::default()
    };
    let system = Plexus::new(settings);
    system
        .register_sync(
            "fmt",
            FunctionSpec::new("repeat")
                .param(ParamSpec::required("text"))
                .param(ParamSpec::required("times").with_default(Value::Int(1))),
            |_ctx, args, kwargs| {
                let text = args[0].as_str().unwrap_or("").to_string();
                let times = kwargs
                    .get("times")
                    .and_then(|v| v.as_int())
                    .unwrap_or(1)
                    .max(0) as usize;
                Ok(Value::Str(text.repeat(times)))
            },
        )
        .unwrap();
    system
        .start(BackendConfig::Thread { workers: 1 })
        .await
        .unwrap();
    let result = system
        .execute_code("repeat(\"ab\", times=3)", Scope::all(), None)
        .await
        .unwrap();
    assert_eq!(result, Value::Str("ababab".into()));
    system.shutdown().await;
}
