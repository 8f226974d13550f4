//! Cooperative cancellation and context propagation across the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::context::{decode_context, encode_context, Context};
use crate::handler::MethodMap;
use crate::local::{Local, LocalOptions};
use crate::options::{ClientOptions, ServerOptions};
use crate::{ErrorCode, RPC_CANCEL};

/// A method that reports when it starts and then parks until its context
/// ends, reporting the reason as its error.
fn parking_map(started_tx: mpsc::UnboundedSender<()>) -> MethodMap {
    let mut map = MethodMap::new();
    map.insert_fn("park", move |ctx, _req| {
        let started_tx = started_tx.clone();
        async move {
            let _ = started_tx.send(());
            let cause = ctx.done().await;
            Err(cause.as_error())
        }
    });
    map
}

#[tokio::test]
async fn test_cancellation_round_trip() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let loc = Arc::new(Local::new(
        Arc::new(parking_map(started_tx)),
        LocalOptions::default(),
    ));

    let ctx = Context::new();
    let call = {
        let loc = loc.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { loc.client.call(&ctx, "park", None).await })
    };

    // The handler is parked on its context; cancel from the caller side.
    started_rx.recv().await.expect("handler started");
    ctx.cancel();

    // The caller observes the cancellation cause.
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);

    // The server received rpc.cancel, released the handler, and stays
    // serviceable.
    let info = loc.client.rpc_server_info(&Context::new()).await.unwrap();
    assert!(info.counters["rpc.requests"] >= 2);
    assert!(loc.close().await.ok());
}

#[tokio::test]
async fn test_deadline_cancels_caller() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let loc = Arc::new(Local::new(
        Arc::new(parking_map(started_tx)),
        LocalOptions::default(),
    ));

    let ctx = Context::new().with_timeout(Duration::from_millis(30));
    let err = loc.client.call(&ctx, "park", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
    started_rx.recv().await.expect("handler started");
    loc.close().await;
}

#[tokio::test]
async fn test_disable_cancel_leaves_server_running() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let released = Arc::new(AtomicUsize::new(0));
    let mut map = MethodMap::new();
    {
        let released = released.clone();
        map.insert_fn("park", move |ctx, _req| {
            let started_tx = started_tx.clone();
            let released = released.clone();
            async move {
                let _ = started_tx.send(());
                ctx.done().await;
                released.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
    }
    let opts = LocalOptions {
        client: ClientOptions::default().with_disable_cancel(true),
        ..Default::default()
    };
    let loc = Arc::new(Local::new(Arc::new(map), opts));

    let ctx = Context::new();
    let call = {
        let loc = loc.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { loc.client.call(&ctx, "park", None).await })
    };
    started_rx.recv().await.expect("handler started");
    ctx.cancel();
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);

    // No rpc.cancel went out, so the handler is still parked.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(released.load(Ordering::SeqCst), 0);

    // Shutdown cancels the in-flight context and drains the handler.
    assert!(loc.close().await.ok());
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_on_cancel_hook_observes_abandoned_call() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
    let opts = LocalOptions {
        client: ClientOptions::default().with_on_cancel(move |rsp| {
            let _ = hook_tx.send((rsp.id_key(), rsp.err().map(|e| e.code())));
        }),
        ..Default::default()
    };
    let loc = Arc::new(Local::new(Arc::new(parking_map(started_tx)), opts));

    let ctx = Context::new();
    let call = {
        let loc = loc.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { loc.client.call(&ctx, "park", None).await })
    };
    started_rx.recv().await.expect("handler started");
    ctx.cancel();
    assert!(call.await.unwrap().is_err());

    let (id, code) = hook_rx.recv().await.expect("hook fired");
    assert_eq!(id, "1");
    assert_eq!(code, Some(ErrorCode::Cancelled));
    loc.close().await;
}

#[tokio::test]
async fn test_rpc_cancel_call_form_is_unknown() {
    let loc = Local::new(Arc::new(MethodMap::new()), LocalOptions::default());
    let err = loc
        .client
        .call(&Context::new(), RPC_CANCEL, Some(json!([1])))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MethodNotFound);
    loc.close().await;
}

#[tokio::test]
async fn test_carrier_hooks_propagate_deadline_and_context() {
    let mut map = MethodMap::new();
    map.insert_fn("inspect", |ctx, req| async move {
        Ok(json!({
            "deadline": ctx.deadline().map(|dl| dl.to_rfc3339()),
            "meta": ctx.metadata_as::<Value>()?,
            "auth": ctx.auth_token().map(String::from_utf8_lossy),
            "params": req.params().cloned(),
        }))
    });
    let opts = LocalOptions {
        client: ClientOptions::default().with_encode_context(encode_context),
        server: ServerOptions::default().with_decode_context(decode_context),
    };
    let loc = Local::new(Arc::new(map), opts);

    let deadline = Utc::now() + chrono::Duration::seconds(60);
    let ctx = Context::new()
        .with_deadline(deadline)
        .with_metadata(&json!({"tenant": "blue"}))
        .unwrap()
        .with_auth_token(b"sesame".as_slice());

    let seen: Value = loc
        .client
        .call_result(&ctx, "inspect", Some(json!({"apple": "pear"})))
        .await
        .unwrap();

    assert_eq!(seen["meta"], json!({"tenant": "blue"}));
    assert_eq!(seen["auth"], json!("sesame"));
    assert_eq!(seen["params"], json!({"apple": "pear"}));
    let echoed = chrono::DateTime::parse_from_rfc3339(seen["deadline"].as_str().unwrap())
        .unwrap()
        .with_timezone(&Utc);
    assert_eq!(echoed, deadline);
    loc.close().await;
}

#[tokio::test]
async fn test_batch_cancel_abandons_all_outstanding() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    // Both members must park at once, regardless of the host's core count.
    let opts = LocalOptions {
        server: ServerOptions::default().with_concurrency(2),
        ..Default::default()
    };
    let loc = Arc::new(Local::new(Arc::new(parking_map(started_tx)), opts));

    let ctx = Context::new();
    let batch = {
        let loc = loc.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loc.client
                .batch(
                    &ctx,
                    vec![
                        crate::CallSpec::call("park", None),
                        crate::CallSpec::call("park", None),
                    ],
                )
                .await
        })
    };
    started_rx.recv().await.expect("first handler started");
    started_rx.recv().await.expect("second handler started");
    ctx.cancel();

    let err = batch.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert!(loc.close().await.ok());
}
