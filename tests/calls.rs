//! Call semantics: echo, dispatch errors, timeout, single-flight, and
//! bidirectional (server -> client) calls.

mod common;

use common::{host, init_tracing, map_of};
use duplex_rpc::{Client, JsonMap, RpcError, Server, Waiter};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn echo_server() -> Server {
    let waiter = Waiter::new()
        .handle("Echo", |_conn, input| async move { Ok(input) })
        .handle("Fail", |_conn, _input| async move {
            Err::<JsonMap, _>("user boom".into())
        })
        .handle("Slow", |_conn, input| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(input)
        });
    Server::new(0, "s").register_waiter("test", waiter)
}

#[tokio::test]
async fn echo_round_trips_the_input_mapping() {
    init_tracing();
    let running = echo_server().bind().await.unwrap();
    let handle = Client::new(host(running.local_addr()), "s")
        .start()
        .await
        .unwrap();

    let out = handle
        .call("test", "echo", map_of("k", json!("v")))
        .await
        .unwrap();
    assert_eq!(out, map_of("k", json!("v")));
    handle.close().await;
}

#[tokio::test]
async fn waiter_and_method_names_normalize_on_both_ends() {
    init_tracing();
    let waiter = Waiter::new().handle("SetUserInfo", |_conn, input| async move { Ok(input) });
    let running = Server::new(0, "s")
        .register_waiter("UserService", waiter)
        .bind()
        .await
        .unwrap();
    let handle = Client::new(host(running.local_addr()), "s")
        .start()
        .await
        .unwrap();

    // Camel-case at the call site meets snake-case registration.
    let out = handle
        .call("UserService", "SetUserInfo", map_of("uid", json!(1)))
        .await
        .unwrap();
    assert_eq!(out, map_of("uid", json!(1)));
    let out = handle
        .call("user_service", "set_user_info", JsonMap::new())
        .await
        .unwrap();
    assert!(out.is_empty());
}

#[tokio::test]
async fn unknown_waiter_and_method_surface_wire_errors() {
    init_tracing();
    let running = echo_server().bind().await.unwrap();
    let handle = Client::new(host(running.local_addr()), "s")
        .start()
        .await
        .unwrap();

    let err = handle.call("nope", "echo", JsonMap::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::NoWaiter), "got {err:?}");
    assert_eq!(err.to_string(), "no waiter");

    let err = handle.call("test", "nope", JsonMap::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::MethodNotFound), "got {err:?}");

    let err = handle.call("test", "fail", JsonMap::new()).await.unwrap_err();
    match err {
        RpcError::Remote(s) => assert_eq!(s, "user boom"),
        other => panic!("expected Remote, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_handler_times_out_with_the_wire_error() {
    init_tracing();
    let running = echo_server().bind().await.unwrap();
    let handle = Client::new(host(running.local_addr()), "s")
        .call_timeout(Duration::from_millis(300))
        .start()
        .await
        .unwrap();

    let started = Instant::now();
    let err = handle.call("test", "slow", JsonMap::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "call func timeout");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn calls_are_single_flight_per_handle() {
    init_tracing();
    let waiter = Waiter::new().handle("nap", |_conn, input| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(input)
    });
    let running = Server::new(0, "s")
        .register_waiter("test", waiter)
        .bind()
        .await
        .unwrap();
    let handle = Client::new(host(running.local_addr()), "s")
        .start()
        .await
        .unwrap();

    let started = Instant::now();
    let first = handle.clone();
    let second = handle.clone();
    let (a, b) = tokio::join!(
        first.call("test", "nap", JsonMap::new()),
        second.call("test", "nap", JsonMap::new()),
    );
    a.unwrap();
    b.unwrap();
    // The second call queued behind the first's in-flight permit.
    assert!(started.elapsed() >= Duration::from_millis(600));
}

#[tokio::test]
async fn server_calls_back_into_the_client() {
    init_tracing();
    let waiter = Waiter::new().handle("relay", |conn: Arc<duplex_rpc::Connection>, input| {
        async move {
            // Reverse call: invoke the caller's own waiter and pass its
            // answer back as ours.
            conn.call("test", "cb", input).await.map_err(Into::into)
        }
    });
    let running = Server::new(0, "s")
        .register_waiter("up", waiter)
        .bind()
        .await
        .unwrap();

    let client_waiter = Waiter::new().handle("cb", |_: (), mut input: JsonMap| async move {
        input.insert("from".to_owned(), json!("client"));
        Ok(input)
    });
    let handle = Client::new(host(running.local_addr()), "s")
        .register_waiter("test", client_waiter)
        .start()
        .await
        .unwrap();

    let out = handle
        .call("up", "relay", map_of("k", json!("v")))
        .await
        .unwrap();
    assert_eq!(out.get("k"), Some(&json!("v")));
    assert_eq!(out.get("from"), Some(&json!("client")));
}

#[tokio::test]
async fn panicking_handler_fails_only_its_own_call() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let waiter = Waiter::new()
        .handle("boom", move |_conn, _input| {
            seen.fetch_add(1, Ordering::SeqCst);
            async move { panic!("handler exploded") }
        })
        .handle("ok", |_conn, input| async move { Ok(input) });
    let running = Server::new(0, "s")
        .register_waiter("test", waiter)
        .bind()
        .await
        .unwrap();
    let handle = Client::new(host(running.local_addr()), "s")
        .call_timeout(Duration::from_millis(400))
        .start()
        .await
        .unwrap();

    // The panicking dispatch task dies before answering, so the caller
    // times out -- but the connection and its reader survive.
    let err = handle.call("test", "boom", JsonMap::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::CallTimeout));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let out = handle.call("test", "ok", map_of("still", json!("alive"))).await.unwrap();
    assert_eq!(out, map_of("still", json!("alive")));
    assert_eq!(running.manager().online(), 1);
}
