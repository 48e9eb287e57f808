//! End-to-end tests for the IPC server over a real Unix socket.
//!
//! Each test binds its own socket inside a temporary directory and talks to
//! it with `IpcClient` or with raw frames.

#![cfg(unix)]

use ipcx::protocol::{decode_response, encode_request, read_frame, write_frame};
use ipcx::transport;
use ipcx::{
    CallRequest, ClientId, Collection, Function, FunctionError, IpcClient, IpcError, Server,
    SessionState, Status, Value, ValueType,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn math_collection() -> Collection {
    let binary = |f: fn(i64, i64) -> Result<i64, FunctionError>| {
        move |_: ClientId, args: &[Value]| {
            let a = args[0].as_i64().unwrap_or_default();
            let b = args[1].as_i64().unwrap_or_default();
            f(a, b).map(|v| vec![Value::Int64(v)])
        }
    };
    let ints = || vec![ValueType::Int64, ValueType::Int64];

    Collection::new("math")
        .with_function(Function::new(
            "add",
            ints(),
            vec![ValueType::Int64],
            binary(|a, b| Ok(a + b)),
        ))
        .with_function(Function::new(
            "div",
            ints(),
            vec![ValueType::Int64],
            binary(|a, b| {
                if b == 0 {
                    Err(FunctionError::new("division by zero"))
                } else {
                    Ok(a / b)
                }
            }),
        ))
        .with_function(Function::new("panic", vec![], vec![], |_, _| {
            panic!("function blew up")
        }))
}

/// Create a temporary directory and a socket path inside it.
fn socket_path() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("test.sock");
    (dir, path)
}

fn start_math_server(path: &Path) -> Server {
    let server = Server::new();
    server.register_collection(math_collection()).unwrap();
    server.initialize(path).unwrap();
    server
}

/// Poll `condition` until it holds or the timeout expires.
async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[tokio::test]
async fn test_add_returns_sum() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let client = IpcClient::connect(&path).await.unwrap();
    let response = client
        .call_raw("math", "add", vec![Value::Int64(2), Value::Int64(3)])
        .await
        .unwrap();

    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.values, vec![Value::Int64(5)]);
    assert!(response.error.is_none());

    server.finalize();
}

#[tokio::test]
async fn test_unknown_function_is_not_found_and_session_survives() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);
    let client = IpcClient::connect(&path).await.unwrap();

    let response = client
        .call_raw("math", "sub", vec![Value::Int64(1), Value::Int64(2)])
        .await
        .unwrap();
    assert_eq!(response.status, Status::NotFound);

    let response = client.call_raw("physics", "add", vec![]).await.unwrap();
    assert_eq!(response.status, Status::NotFound);

    let values = client
        .call("math", "add", vec![Value::Int64(40), Value::Int64(2)])
        .await
        .unwrap();
    assert_eq!(values, vec![Value::Int64(42)]);
    assert_eq!(server.client_count(), 1);

    server.finalize();
}

#[tokio::test]
async fn test_argument_errors_keep_session_usable() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);
    let client = IpcClient::connect(&path).await.unwrap();

    let response = client
        .call_raw("math", "add", vec![Value::Int64(1)])
        .await
        .unwrap();
    assert_eq!(response.status, Status::ArgumentError);

    let response = client
        .call_raw("math", "add", vec![Value::Int64(1), Value::from("2")])
        .await
        .unwrap();
    assert_eq!(response.status, Status::ArgumentError);

    let values = client
        .call("math", "add", vec![Value::Int64(1), Value::Int64(2)])
        .await
        .unwrap();
    assert_eq!(values, vec![Value::Int64(3)]);

    server.finalize();
}

#[tokio::test]
async fn test_failing_and_panicking_functions_become_error_responses() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);
    let client = IpcClient::connect(&path).await.unwrap();

    let response = client
        .call_raw("math", "div", vec![Value::Int64(1), Value::Int64(0)])
        .await
        .unwrap();
    assert_eq!(response.status, Status::HandlerFailure);
    assert_eq!(response.error.as_deref(), Some("division by zero"));

    let response = client.call_raw("math", "panic", vec![]).await.unwrap();
    assert_eq!(response.status, Status::HandlerFailure);

    let values = client
        .call("math", "div", vec![Value::Int64(9), Value::Int64(3)])
        .await
        .unwrap();
    assert_eq!(values, vec![Value::Int64(3)]);

    server.finalize();
}

#[tokio::test]
async fn test_float_values_cross_the_wire_intact() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);
    server
        .register_collection(
            Collection::new("float")
                .with_function(Function::new(
                    "echo",
                    vec![ValueType::Any],
                    vec![ValueType::Any],
                    |_, args| Ok(args.to_vec()),
                ))
                .with_function(Function::new(
                    "inf",
                    vec![],
                    vec![ValueType::Double],
                    |_, _| Ok(vec![Value::Double(f64::INFINITY)]),
                )),
        )
        .unwrap();
    let client = IpcClient::connect(&path).await.unwrap();

    let values = client.call("float", "inf", vec![]).await.unwrap();
    assert_eq!(values, vec![Value::Double(f64::INFINITY)]);

    for value in [
        Value::Double(0.1),
        Value::Float(-2.5),
        Value::Double(f64::NEG_INFINITY),
        Value::Float(f32::INFINITY),
    ] {
        let values = client.call("float", "echo", vec![value.clone()]).await.unwrap();
        assert_eq!(values, vec![value]);
    }

    let values = client
        .call("float", "echo", vec![Value::Double(f64::NAN)])
        .await
        .unwrap();
    assert!(values[0].as_f64().is_some_and(f64::is_nan));

    let values = client
        .call("math", "add", vec![Value::Int64(1), Value::Int64(1)])
        .await
        .unwrap();
    assert_eq!(values, vec![Value::Int64(2)]);
    assert_eq!(server.client_count(), 1);

    server.finalize();
}

#[tokio::test]
async fn test_panicking_message_handler_still_gets_response() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);
    server.set_message_handler(|_, _| panic!("message handler blew up"));

    let client = IpcClient::connect(&path).await.unwrap();
    let values = client
        .call("math", "add", vec![Value::Int64(2), Value::Int64(3)])
        .await
        .unwrap();
    assert_eq!(values, vec![Value::Int64(5)]);

    let id = server.client_ids()[0];
    assert_eq!(server.session_state(id), Some(SessionState::Active));

    server.finalize();
}

#[tokio::test]
async fn test_panicking_connect_handler_vetoes_and_server_keeps_running() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let connects = counter();
    {
        let connects = connects.clone();
        server.set_connect_handler(move |_| {
            if connects.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("connect handler blew up");
            }
            true
        });
    }

    let rejected = IpcClient::connect(&path).await.unwrap();
    let result = rejected
        .call("math", "add", vec![Value::Int64(1), Value::Int64(1)])
        .await;
    assert!(matches!(result, Err(IpcError::Disconnected)));

    let client = IpcClient::connect(&path).await.unwrap();
    let values = client
        .call("math", "add", vec![Value::Int64(1), Value::Int64(1)])
        .await
        .unwrap();
    assert_eq!(values, vec![Value::Int64(2)]);
    assert_eq!(server.client_count(), 1);
    assert!(server.is_initialized());

    server.finalize();
}

#[tokio::test]
async fn test_duplicate_collection_keeps_first_callable() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let impostor = Collection::new("math").with_function(Function::new(
        "add",
        vec![ValueType::Int64, ValueType::Int64],
        vec![ValueType::Int64],
        |_, _| Ok(vec![Value::Int64(-1)]),
    ));
    let err = server.register_collection(impostor).unwrap_err();
    assert!(matches!(err, IpcError::DuplicateName { .. }));

    let client = IpcClient::connect(&path).await.unwrap();
    let values = client
        .call("math", "add", vec![Value::Int64(2), Value::Int64(2)])
        .await
        .unwrap();
    assert_eq!(values, vec![Value::Int64(4)]);

    server.finalize();
}

#[tokio::test]
async fn test_disconnect_fires_once_and_stops_messages() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let disconnects = Arc::new(Mutex::new(Vec::<ClientId>::new()));
    let messages = counter();
    {
        let disconnects = disconnects.clone();
        server.set_disconnect_handler(move |id| disconnects.lock().unwrap().push(id));
        let messages = messages.clone();
        server.set_message_handler(move |_, _| {
            messages.fetch_add(1, Ordering::SeqCst);
        });
    }

    let client = IpcClient::connect(&path).await.unwrap();
    client
        .call("math", "add", vec![Value::Int64(1), Value::Int64(1)])
        .await
        .unwrap();
    assert_eq!(messages.load(Ordering::SeqCst), 1);

    let id = server.client_ids()[0];
    assert_eq!(server.session_state(id), Some(SessionState::Active));

    drop(client);
    assert!(wait_until(Duration::from_secs(5), || server.client_count() == 0).await);
    assert!(wait_until(Duration::from_secs(5), || disconnects.lock().unwrap().len() == 1).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*disconnects.lock().unwrap(), vec![id]);
    assert_eq!(messages.load(Ordering::SeqCst), 1);
    assert_eq!(server.session_state(id), None);

    // Finalize must not report the already-closed session again
    server.finalize();
    assert_eq!(disconnects.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_requests_from_one_client_are_answered_in_order() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let mut conn = transport::connect(&path).await.unwrap();
    for id in 1..=5u64 {
        let args = vec![Value::Int64(id as i64), Value::Int64(0)];
        let request = CallRequest::new(id, "math", "add", args);
        write_frame(&mut conn.writer, &encode_request(&request).unwrap())
            .await
            .unwrap();
    }

    for id in 1..=5u64 {
        let frame = read_frame(&mut conn.reader).await.unwrap().unwrap();
        let response = decode_response(&frame).unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.values, vec![Value::Int64(id as i64)]);
    }

    server.finalize();
}

#[tokio::test]
async fn test_concurrent_clients_all_get_answers() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let mut tasks = Vec::new();
    for n in 0..4i64 {
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            let client = IpcClient::connect(&path).await.unwrap();
            let mut sums = Vec::new();
            for i in 0..10i64 {
                let values = client
                    .call("math", "add", vec![Value::Int64(n), Value::Int64(i)])
                    .await
                    .unwrap();
                sums.push(values[0].as_i64().unwrap());
            }
            sums
        }));
    }

    for (n, task) in tasks.into_iter().enumerate() {
        let sums = task.await.unwrap();
        let expected: Vec<i64> = (0..10).map(|i| n as i64 + i).collect();
        assert_eq!(sums, expected);
    }

    server.finalize();
}

#[tokio::test]
async fn test_finalize_disconnects_every_session_and_allows_reinitialize() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let disconnects = counter();
    {
        let disconnects = disconnects.clone();
        server.set_disconnect_handler(move |_| {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = IpcClient::connect(&path).await.unwrap();
        client
            .call("math", "add", vec![Value::Int64(0), Value::Int64(0)])
            .await
            .unwrap();
        clients.push(client);
    }
    assert_eq!(server.client_count(), 3);

    server.finalize();

    assert_eq!(disconnects.load(Ordering::SeqCst), 3);
    assert_eq!(server.client_count(), 0);
    assert!(server.collection_names().is_empty());
    for client in &clients {
        let result = client.call("math", "add", vec![]).await;
        assert!(matches!(result, Err(IpcError::Disconnected)));
    }

    // Ready for another round
    server.register_collection(math_collection()).unwrap();
    server.initialize(&path).unwrap();
    let client = IpcClient::connect(&path).await.unwrap();
    let values = client
        .call("math", "add", vec![Value::Int64(1), Value::Int64(1)])
        .await
        .unwrap();
    assert_eq!(values, vec![Value::Int64(2)]);

    server.finalize();
    assert_eq!(disconnects.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_vetoed_connection_is_closed_without_disconnect_event() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let disconnects = counter();
    {
        let disconnects = disconnects.clone();
        server.set_disconnect_handler(move |_| {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }
    server.set_connect_handler(|_| false);

    let client = IpcClient::connect(&path).await.unwrap();
    let result = client
        .call("math", "add", vec![Value::Int64(1), Value::Int64(1)])
        .await;
    assert!(matches!(result, Err(IpcError::Disconnected)));
    assert_eq!(server.client_count(), 0);

    server.finalize();
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_last_connect_handler_wins() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let first = counter();
    let second = counter();
    {
        let first = first.clone();
        server.set_connect_handler(move |_| {
            first.fetch_add(1, Ordering::SeqCst);
            true
        });
        let second = second.clone();
        server.set_connect_handler(move |_| {
            second.fetch_add(1, Ordering::SeqCst);
            true
        });
    }

    let client = IpcClient::connect(&path).await.unwrap();
    client
        .call("math", "add", vec![Value::Int64(1), Value::Int64(1)])
        .await
        .unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    server.finalize();
}

#[tokio::test]
async fn test_connect_handler_can_register_collection() {
    let (_dir, path) = socket_path();
    let server = Arc::new(start_math_server(&path));

    let weak = Arc::downgrade(&server);
    server.set_connect_handler(move |id| {
        if let Some(server) = weak.upgrade() {
            let name = format!("session_{}", id.0);
            let collection = Collection::new(name).with_function(Function::new(
                "whoami",
                vec![],
                vec![ValueType::UInt64],
                |client, _| Ok(vec![Value::UInt64(client.0)]),
            ));
            server.register_collection(collection).unwrap();
        }
        true
    });

    let client = IpcClient::connect(&path).await.unwrap();
    // The session is admitted once the first call is answered.
    client
        .call("math", "add", vec![Value::Int64(0), Value::Int64(0)])
        .await
        .unwrap();
    let id = server.client_ids()[0];

    let values = client
        .call(&format!("session_{}", id.0), "whoami", vec![])
        .await
        .unwrap();
    assert_eq!(values, vec![Value::UInt64(id.0)]);

    server.finalize();
}

#[tokio::test]
async fn test_malformed_frame_disconnects_session() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let disconnects = counter();
    {
        let disconnects = disconnects.clone();
        server.set_disconnect_handler(move |_| {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }

    let mut conn = transport::connect(&path).await.unwrap();
    write_frame(&mut conn.writer, b"not valid json").await.unwrap();

    // No response frame, just end of stream
    let frame = read_frame(&mut conn.reader).await.unwrap();
    assert!(frame.is_none());

    assert!(wait_until(Duration::from_secs(5), || disconnects.load(Ordering::SeqCst) == 1).await);
    assert_eq!(server.client_count(), 0);

    server.finalize();
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_client_ids_are_unique() {
    let (_dir, path) = socket_path();
    let server = start_math_server(&path);

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = IpcClient::connect(&path).await.unwrap();
        client
            .call("math", "add", vec![Value::Int64(0), Value::Int64(0)])
            .await
            .unwrap();
        clients.push(client);
    }
    let first_round = server.client_ids();
    assert_eq!(first_round.len(), 3);

    drop(clients);
    assert!(wait_until(Duration::from_secs(5), || server.client_count() == 0).await);

    let client = IpcClient::connect(&path).await.unwrap();
    client
        .call("math", "add", vec![Value::Int64(0), Value::Int64(0)])
        .await
        .unwrap();
    let id = server.client_ids()[0];
    assert!(!first_round.contains(&id));

    server.finalize();
}
