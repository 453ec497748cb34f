use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plugrpc_frame::{Link, LinkReceiver, LinkSender, RPC};
use plugrpc_peer::{
    Connection, ErrorKind, Message, MethodTable, Proxy, RpcError, RpcObject, Value, WireValue,
};

fn counter_object() -> Arc<dyn RpcObject> {
    let count = Arc::new(AtomicI64::new(0));
    MethodTable::new("counter")
        .method("increment", move |_call| {
            let count = Arc::clone(&count);
            async move { Ok(Value::Int(count.fetch_add(1, Ordering::SeqCst) + 1)) }
        })
        .into_object()
}

fn plugin_root() -> Arc<dyn RpcObject> {
    MethodTable::new("root")
        .method("add", |call| async move {
            Ok(Value::Int(call.arg_i64(0)? + call.arg_i64(1)?))
        })
        .method("echo", |call| async move { Ok(call.arg(0)?.clone()) })
        .method("counter", |_call| async move { Ok(Value::Object(counter_object())) })
        .method("slow_counter", |call| async move {
            tokio::time::sleep(Duration::from_millis(call.arg_i64(0)? as u64)).await;
            Ok(Value::Object(counter_object()))
        })
        .method("fail", |call| async move {
            Err(RpcError::throw(format!("failed: {}", call.arg_str(0)?)))
        })
        .method("panic", |_call| async move {
            if true {
                panic!("plugin bug");
            }
            Ok(Value::Null)
        })
        .method("sleep", |call| async move {
            let millis = call.arg_i64(0)?;
            tokio::time::sleep(Duration::from_millis(millis as u64)).await;
            Ok(Value::Int(millis))
        })
        .method("apply", |call| async move {
            let callback = call
                .arg(0)?
                .as_object()
                .cloned()
                .ok_or_else(|| RpcError::throw("apply: argument 0 is not an object"))?;
            let value = call.arg(1)?.clone();
            let proxy = callback
                .as_proxy()
                .ok_or_else(|| RpcError::throw("apply: expected a proxy"))?
                .clone();
            proxy.invoke("double", vec![value]).await
        })
        .method("write_handle", |mut call| async move {
            let fd = call
                .handle
                .take()
                .ok_or_else(|| RpcError::throw("no handle attached"))?;
            let mut stream = std::os::unix::net::UnixStream::from(fd);
            stream
                .write_all(call.arg_str(0)?.as_bytes())
                .map_err(|err| RpcError::throw(err.to_string()))?;
            Ok(Value::Bool(true))
        })
        .into_object()
}

/// Host and plugin peers over an in-memory link; returns the root proxy.
async fn connected() -> (Connection, Connection, Proxy) {
    let (host_link, plugin_link) = Link::memory_pair();
    let host = Connection::new("host", host_link);
    let plugin = Connection::new("plugin", plugin_link);

    let root_ref = plugin.peer.export(plugin_root()).unwrap();
    let root = host.peer.import(&root_ref).unwrap();
    let proxy = root.as_proxy().unwrap().clone();
    (host, plugin, proxy)
}

/// A host peer whose other end is driven by hand.
fn raw_pair() -> (Connection, LinkSender, LinkReceiver) {
    let (host_link, raw_link) = Link::memory_pair();
    let host = Connection::new("host", host_link);
    let (tx, rx) = raw_link.split();
    (host, tx, rx)
}

async fn next_message(rx: &mut LinkReceiver) -> Message {
    let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound.channel, RPC);
    Message::from_bytes(&inbound.payload).unwrap()
}

fn send_raw(tx: &LinkSender, message: &Message) {
    tx.send(RPC, message.to_bytes().unwrap(), None).unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn add_resolves_with_sum() {
    let (_host, _plugin, root) = connected().await;
    let sum = root
        .invoke("add", vec![Value::Int(2), Value::Int(3)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(5));
}

#[tokio::test]
async fn plain_values_survive_the_round_trip() {
    let (_host, _plugin, root) = connected().await;

    let mut map = BTreeMap::new();
    map.insert("name".to_string(), Value::from("camera"));
    map.insert("ratio".to_string(), Value::Float(0.5));
    map.insert("raw".to_string(), Value::Bytes(vec![0, 255, 7]));
    map.insert(
        "nested".to_string(),
        Value::List(vec![Value::Null, Value::Bool(false), Value::Int(-9)]),
    );
    let original = Value::Map(map);

    let echoed = root.invoke("echo", vec![original.clone()]).await.unwrap();
    assert_eq!(echoed, original);
}

#[tokio::test]
async fn replies_are_matched_by_call_id() {
    let (host, raw_tx, mut raw_rx) = raw_pair();
    let target = host.peer.get_proxy(1);

    let mut calls = Vec::new();
    for i in 0..5i64 {
        let target = target.clone();
        calls.push(tokio::spawn(async move {
            target.invoke("scale", vec![Value::Int(i)]).await
        }));
    }

    let mut invokes = Vec::new();
    for _ in 0..5 {
        match next_message(&mut raw_rx).await {
            Message::Invoke { call_id, args, .. } => invokes.push((call_id, args)),
            other => panic!("unexpected {other:?}"),
        }
    }

    for (call_id, args) in invokes.into_iter().rev() {
        let WireValue::Int(n) = args[0] else {
            panic!("expected int argument");
        };
        send_raw(
            &raw_tx,
            &Message::Result {
                call_id,
                value: WireValue::Int(n * 10),
            },
        );
    }

    for (i, call) in calls.into_iter().enumerate() {
        let value = call.await.unwrap().unwrap();
        assert_eq!(value, Value::Int(i as i64 * 10));
    }
    assert_eq!(host.peer.pending_count(), 0);
}

#[tokio::test]
async fn unknown_call_id_is_only_a_violation() {
    let (host, raw_tx, mut raw_rx) = raw_pair();

    send_raw(
        &raw_tx,
        &Message::Result {
            call_id: 999,
            value: WireValue::Null,
        },
    );
    eventually(|| host.peer.protocol_violations() == 1).await;

    // The peer keeps working afterwards.
    let target = host.peer.get_proxy(1);
    let call = tokio::spawn(async move { target.invoke("ping", vec![]).await });
    let Message::Invoke { call_id, .. } = next_message(&mut raw_rx).await else {
        panic!("expected invoke");
    };
    send_raw(
        &raw_tx,
        &Message::Result {
            call_id,
            value: WireValue::Str("pong".into()),
        },
    );
    assert_eq!(call.await.unwrap().unwrap(), Value::from("pong"));
}

#[tokio::test]
async fn duplicate_reply_is_a_violation() {
    let (host, raw_tx, mut raw_rx) = raw_pair();
    let target = host.peer.get_proxy(1);
    let call = tokio::spawn(async move { target.invoke("once", vec![]).await });

    let Message::Invoke { call_id, .. } = next_message(&mut raw_rx).await else {
        panic!("expected invoke");
    };
    let reply = Message::Result {
        call_id,
        value: WireValue::Int(1),
    };
    send_raw(&raw_tx, &reply);
    send_raw(&raw_tx, &reply);

    assert_eq!(call.await.unwrap().unwrap(), Value::Int(1));
    eventually(|| host.peer.protocol_violations() == 1).await;
}

#[tokio::test]
async fn garbage_payload_is_dropped() {
    let (host, raw_tx, _raw_rx) = raw_pair();
    raw_tx.send(RPC, "not json at all", None).unwrap();
    eventually(|| host.peer.protocol_violations() == 1).await;
    assert!(!host.peer.is_closed());
}

#[tokio::test]
async fn duplicate_finalize_is_harmless() {
    let (plugin, raw_tx, _raw_rx) = raw_pair();
    let exported = plugin.peer.export(counter_object()).unwrap();
    assert_eq!(plugin.peer.stub_count(), 1);

    let finalize = Message::Finalize {
        target_id: exported.id,
        generation: exported.generation,
    };
    send_raw(&raw_tx, &finalize);
    send_raw(&raw_tx, &finalize);
    send_raw(
        &raw_tx,
        &Message::Finalize {
            target_id: 12345,
            generation: 1,
        },
    );

    eventually(|| plugin.peer.stub_count() == 0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(plugin.peer.stub_count(), 0);
    assert_eq!(plugin.peer.protocol_violations(), 0);
}

#[tokio::test]
async fn late_finalize_does_not_release_reexported_object() {
    let (plugin, _raw_tx, _raw_rx) = raw_pair();
    let object = counter_object();

    let first = plugin.peer.export(Arc::clone(&object)).unwrap();
    let second = plugin.peer.export(Arc::clone(&object)).unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.generation, first.generation + 1);

    assert!(!plugin.peer.finalize(first.id, first.generation));
    assert!(plugin.peer.is_exported(first.id));
    assert!(plugin.peer.finalize(second.id, second.generation));
    assert!(!plugin.peer.is_exported(first.id));
}

#[tokio::test]
async fn nested_capability_gets_its_own_id() {
    let (host, raw_tx, mut raw_rx) = raw_pair();
    let root = host.peer.get_proxy(1);

    let caller = root.clone();
    let call = tokio::spawn(async move { caller.invoke("counter", vec![]).await });
    let Message::Invoke { call_id, target_id, .. } = next_message(&mut raw_rx).await else {
        panic!("expected invoke");
    };
    assert_eq!(target_id, 1);
    send_raw(
        &raw_tx,
        &Message::Result {
            call_id,
            value: WireValue::Ref(plugrpc_peer::ObjectRef {
                id: 2,
                generation: 1,
                owner: plugrpc_peer::Owner::Sender,
            }),
        },
    );

    let counter = call.await.unwrap().unwrap();
    let counter = counter.as_proxy().unwrap().clone();
    assert_eq!(counter.id(), 2);

    let increment = tokio::spawn(async move { counter.invoke("increment", vec![]).await });
    let Message::Invoke { call_id, target_id, method, .. } = next_message(&mut raw_rx).await
    else {
        panic!("expected invoke");
    };
    assert_eq!(target_id, 2);
    assert_eq!(method, "increment");
    send_raw(
        &raw_tx,
        &Message::Result {
            call_id,
            value: WireValue::Int(1),
        },
    );
    assert_eq!(increment.await.unwrap().unwrap(), Value::Int(1));
}

#[tokio::test]
async fn nested_capability_end_to_end() {
    let (_host, plugin, root) = connected().await;

    let counter = root.invoke("counter", vec![]).await.unwrap();
    let counter = counter.as_proxy().unwrap().clone();
    assert_ne!(counter.id(), root.id());
    assert!(plugin.peer.is_exported(counter.id()));

    assert_eq!(counter.invoke("increment", vec![]).await.unwrap(), Value::Int(1));
    assert_eq!(counter.invoke("increment", vec![]).await.unwrap(), Value::Int(2));
}

#[tokio::test]
async fn dropping_last_proxy_releases_stub() {
    let (_host, plugin, root) = connected().await;

    let counter = root.invoke("counter", vec![]).await.unwrap();
    let id = counter.as_proxy().unwrap().id();
    assert!(plugin.peer.is_exported(id));

    let clone = counter.clone();
    drop(counter);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(plugin.peer.is_exported(id));

    drop(clone);
    eventually(|| !plugin.peer.is_exported(id)).await;
    assert!(plugin.peer.is_exported(root.id()));
}

#[tokio::test]
async fn dispose_is_explicit_and_idempotent() {
    let (_host, plugin, root) = connected().await;

    let counter = root.invoke("counter", vec![]).await.unwrap();
    let counter = counter.as_proxy().unwrap().clone();
    counter.dispose();
    counter.dispose();
    eventually(|| !plugin.peer.is_exported(counter.id())).await;

    let err = counter.invoke("increment", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::StaleProxy { .. }));
}

#[tokio::test]
async fn stale_target_is_reported() {
    let (host, _plugin, _root) = connected().await;
    let ghost = host.peer.get_proxy(999);
    let err = ghost.invoke("anything", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::StaleProxy { target_id: 999 }));
    assert_eq!(err.kind(), ErrorKind::StaleProxy);
}

#[tokio::test]
async fn stale_target_releases_capability_arguments() {
    let (host, _plugin, _root) = connected().await;
    let ghost = host.peer.get_proxy(999);
    let err = ghost
        .invoke("anything", vec![Value::Object(counter_object())])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::StaleProxy { target_id: 999 }));
    eventually(|| host.peer.stub_count() == 0).await;
}

#[tokio::test]
async fn rejected_argument_releases_its_siblings() {
    let (host, plugin, root) = connected().await;
    let dangling = Value::from(host.peer.get_proxy(77));
    let err = root
        .invoke("echo", vec![Value::Object(counter_object()), dangling])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StaleProxy);
    eventually(|| host.peer.stub_count() == 0).await;
    assert_eq!(plugin.peer.stub_count(), 1);
}

#[tokio::test]
async fn remote_failure_is_a_remote_throw() {
    let (_host, _plugin, root) = connected().await;
    let err = root
        .invoke("fail", vec![Value::from("no camera")])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::RemoteThrow { ref message } if message == "failed: no camera"));
}

#[tokio::test]
async fn panicking_method_does_not_take_the_peer_down() {
    let (_host, plugin, root) = connected().await;
    let err = root.invoke("panic", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::RemoteThrow { ref message } if message.contains("plugin bug")));

    assert!(!plugin.peer.is_closed());
    assert_eq!(
        root.invoke("add", vec![Value::Int(1), Value::Int(1)]).await.unwrap(),
        Value::Int(2)
    );
}

#[tokio::test]
async fn unserializable_argument_fails_locally() {
    let (host, raw_tx, mut raw_rx) = raw_pair();
    let target = host.peer.get_proxy(1);

    let err = target
        .invoke("store", vec![Value::object(MethodTable::new("cb")), Value::Float(f64::NAN)])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Serialization(_)));
    assert_eq!(host.peer.stub_count(), 0);
    assert_eq!(host.peer.pending_count(), 0);

    // Nothing reached the wire: the next message seen is the next call.
    let call = tokio::spawn(async move { target.invoke("store", vec![Value::Int(1)]).await });
    let Message::Invoke { call_id, args, .. } = next_message(&mut raw_rx).await else {
        panic!("expected invoke");
    };
    assert_eq!(args, vec![WireValue::Int(1)]);
    send_raw(
        &raw_tx,
        &Message::Result {
            call_id,
            value: WireValue::Null,
        },
    );
    assert!(call.await.unwrap().unwrap().is_null());
}

#[tokio::test]
async fn too_deep_values_are_rejected() {
    let (_host, _plugin, root) = connected().await;
    let mut value = Value::Int(0);
    for _ in 0..100 {
        value = Value::List(vec![value]);
    }
    let err = root.invoke("echo", vec![value]).await.unwrap_err();
    assert!(matches!(err, RpcError::Serialization(_)));
}

#[tokio::test]
async fn host_callbacks_are_reachable_from_the_plugin() {
    let (host, _plugin, root) = connected().await;
    let doubler = MethodTable::new("doubler")
        .method("double", |call| async move { Ok(Value::Int(call.arg_i64(0)? * 2)) })
        .into_object();

    let result = root
        .invoke("apply", vec![Value::Object(doubler), Value::Int(21)])
        .await
        .unwrap();
    assert_eq!(result, Value::Int(42));

    // The plugin dropped its proxy once the call finished.
    eventually(|| host.peer.stub_count() == 0).await;
}

#[tokio::test]
async fn handing_back_a_proxy_resolves_to_the_original_object() {
    let (_host, _plugin, root) = connected().await;
    let local = Value::Object(counter_object());

    let echoed = root.invoke("echo", vec![local.clone()]).await.unwrap();
    assert_eq!(echoed, local);
    assert!(echoed.as_proxy().is_none());
}

#[tokio::test]
async fn handle_travels_with_invoke() {
    let (host, _plugin, root) = connected().await;
    let (mut ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();

    let result = host
        .peer
        .invoke_with_handle(
            root.id(),
            "write_handle",
            vec![Value::from("via-handle")],
            OwnedFd::from(theirs),
        )
        .await
        .unwrap();
    assert_eq!(result, Value::Bool(true));

    let mut buf = [0u8; 10];
    ours.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"via-handle");
}

#[tokio::test]
async fn timeout_stops_waiting_without_leaking() {
    let (host, _plugin, root) = connected().await;
    let err = root
        .invoke_timeout("sleep", vec![Value::Int(500)], Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));
    assert_eq!(host.peer.pending_count(), 0);
}

#[tokio::test]
async fn late_reply_releases_its_capabilities() {
    let (host, plugin, root) = connected().await;
    let err = root
        .invoke_timeout("slow_counter", vec![Value::Int(100)], Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));

    eventually(|| host.peer.protocol_violations() == 1).await;
    eventually(|| plugin.peer.stub_count() == 1).await;
    assert!(plugin.peer.is_exported(root.id()));
    assert_eq!(host.peer.proxy_count(), 1);
}

#[tokio::test]
async fn unversioned_proxy_never_releases_on_drop() {
    let (host, plugin, _root) = connected().await;
    let exported = plugin.peer.export(counter_object()).unwrap();

    let ghost = host.peer.get_proxy(exported.id);
    assert_eq!(ghost.generation(), 0);
    assert_eq!(
        ghost.invoke("increment", vec![]).await.unwrap(),
        Value::Int(1)
    );
    ghost.dispose();
    drop(ghost);
    drop(host.peer.get_proxy(exported.id));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(plugin.peer.is_exported(exported.id));

    host.peer.release(exported.id);
    eventually(|| !plugin.peer.is_exported(exported.id)).await;
}

#[tokio::test]
async fn disconnect_rejects_every_pending_call_once() {
    let (host, plugin, root) = connected().await;

    let mut calls = Vec::new();
    for _ in 0..3 {
        let root = root.clone();
        calls.push(tokio::spawn(async move {
            root.invoke("sleep", vec![Value::Int(10_000)]).await
        }));
    }
    eventually(|| host.peer.pending_count() == 3).await;

    plugin.shutdown().await;

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::PeerDisconnected(_)));
    }
    eventually(|| host.peer.is_closed()).await;
    assert_eq!(host.peer.pending_count(), 0);
    assert_eq!(host.peer.stub_count(), 0);

    let err = root.invoke("add", vec![Value::Int(1), Value::Int(2)]).await.unwrap_err();
    assert!(matches!(err, RpcError::PeerDisconnected(_)));
}

#[tokio::test]
async fn pipe_link_refuses_handles() {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (lr, lw) = tokio::io::split(left);
    let (rr, rw) = tokio::io::split(right);
    let config = plugrpc_frame::FrameConfig::default();
    let host = Connection::new("host", Link::pipe(lr, lw, &config));
    let plugin = Connection::new("plugin", Link::pipe(rr, rw, &config));

    let root_ref = plugin.peer.export(plugin_root()).unwrap();
    let root = host.peer.import(&root_ref).unwrap();
    let root = root.as_proxy().unwrap().clone();

    assert_eq!(
        root.invoke("add", vec![Value::Int(2), Value::Int(3)]).await.unwrap(),
        Value::Int(5)
    );

    let (_ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
    let err = root
        .invoke_with_handle("write_handle", vec![Value::from("x")], OwnedFd::from(theirs))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

    // Once closed, the disconnect wins over the missing capability.
    host.peer.close("test over");
    let (_ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
    let err = root
        .invoke_with_handle("write_handle", vec![Value::from("x")], OwnedFd::from(theirs))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::PeerDisconnected(_)));
}
