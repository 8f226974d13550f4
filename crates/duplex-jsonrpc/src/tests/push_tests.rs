//! Server-initiated traffic: push notifications and callbacks.

use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::context::Context;
use crate::handler::MethodMap;
use crate::local::{Local, LocalOptions};
use crate::options::{ClientOptions, ServerOptions};
use crate::{ErrorCode, RpcError};

fn push_options(client: ClientOptions) -> LocalOptions {
    LocalOptions {
        client,
        server: ServerOptions::default().with_allow_push(true),
    }
}

#[tokio::test]
async fn test_push_disabled_by_default() {
    let loc = Local::new(Arc::new(MethodMap::new()), LocalOptions::default());
    let err = loc.server.notify("tick", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);
    let err = loc
        .server
        .callback(&Context::new(), "ask", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);
    loc.close().await;
}

#[tokio::test]
async fn test_notify_reaches_client_hook() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let opts = push_options(ClientOptions::default().with_on_notify(move |req| {
        let _ = tx.send((req.method().to_string(), req.params().cloned()));
    }));
    let loc = Local::new(Arc::new(MethodMap::new()), opts);

    loc.server
        .notify("tick", Some(json!({"n": 1})))
        .await
        .unwrap();

    let (method, params) = rx.recv().await.expect("notification delivered");
    assert_eq!(method, "tick");
    assert_eq!(params, Some(json!({"n": 1})));
    loc.close().await;
}

#[tokio::test]
async fn test_callback_round_trip() {
    let opts = push_options(ClientOptions::default().with_on_callback(|_ctx, req| {
        async move {
            let args: Vec<i64> = req.params_as()?;
            Ok(json!(args.iter().product::<i64>()))
        }
        .boxed()
    }));
    let loc = Local::new(Arc::new(MethodMap::new()), opts);

    let rsp = loc
        .server
        .callback(&Context::new(), "multiply", Some(json!([6, 7])))
        .await
        .unwrap();
    assert_eq!(rsp.result_as::<i64>().unwrap(), 42);
    loc.close().await;
}

#[tokio::test]
async fn test_callback_error_surfaces_to_server() {
    let opts = push_options(ClientOptions::default().with_on_callback(|_ctx, _req| {
        async { Err(RpcError::invalid_params("refused")) }.boxed()
    }));
    let loc = Local::new(Arc::new(MethodMap::new()), opts);

    let err = loc
        .server
        .callback(&Context::new(), "ask", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParams);
    assert_eq!(err.message(), "refused");
    loc.close().await;
}

#[tokio::test]
async fn test_callback_panic_is_reported_not_hung() {
    fn detonate() -> Result<Value, RpcError> {
        panic!("callback kaboom")
    }
    let opts = push_options(
        ClientOptions::default().with_on_callback(|_ctx, _req| async { detonate() }.boxed()),
    );
    let loc = Local::new(Arc::new(MethodMap::new()), opts);

    // The server must get an answer even though the handler never
    // produced one.
    let err = loc
        .server
        .callback(&Context::new(), "ask", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);
    assert!(err.message().contains("panic in callback handler"));
    loc.close().await;
}

#[tokio::test]
async fn test_callback_without_hook_is_discarded() {
    let loc = Local::new(
        Arc::new(MethodMap::new()),
        push_options(ClientOptions::default()),
    );

    // No on_callback hook: the wait must end by context, not by reply.
    let ctx = Context::new().with_timeout(std::time::Duration::from_millis(40));
    let err = loc.server.callback(&ctx, "ask", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
    loc.close().await;
}

#[tokio::test]
async fn test_push_and_calls_share_the_connection() {
    // Traffic flows both ways at once on one connection without deadlock:
    // a client call is in flight while the server runs a callback.
    let mut map = MethodMap::new();
    map.insert_fn("relay", |_ctx, req| async move {
        Ok(req.params().cloned().unwrap_or(Value::Null))
    });
    let opts = push_options(ClientOptions::default().with_on_callback(|_ctx, _req| {
        async { Ok(json!("pong")) }.boxed()
    }));
    let loc = Arc::new(Local::new(Arc::new(map), opts));

    let call = {
        let loc = loc.clone();
        tokio::spawn(async move {
            loc.client
                .call(&Context::new(), "relay", Some(json!(["x"])))
                .await
        })
    };
    let rsp = loc
        .server
        .callback(&Context::new(), "ping", None)
        .await
        .unwrap();
    assert_eq!(rsp.result_as::<String>().unwrap(), "pong");
    assert!(call.await.unwrap().is_ok());
    assert!(loc.close().await.ok());
}
