//! Integration tests for the synchronous session.
//!
//! Each test drives a `Session` on the test thread against a scripted peer
//! running on its own thread and tokio runtime. The two sides are connected by
//! an in-memory duplex stream, so no editor needs to be installed.
//!
//! # Running
//!
//! ```bash
//! cargo test --test session_integration -- --nocapture
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::thread::JoinHandle;
use std::time::Duration;

use editor_rpc::rpc::{read_message, write_message, Message, MessageDecoder};
use editor_rpc::{
    DispatchError, DispatchKind, Handle, HandlerError, InboundMessage, Session, SessionConfig,
    SessionError, Transport,
};
use pretty_assertions::assert_eq;
use rmpv::Value;
use tokio::io::DuplexStream;

const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// The editor side of the connection.
struct Peer {
    stream: DuplexStream,
    decoder: MessageDecoder,
}

impl Peer {
    async fn recv(&mut self) -> Message {
        read_message(&mut self.stream, &mut self.decoder)
            .await
            .expect("peer read failed")
    }

    async fn send(&mut self, message: Message) {
        write_message(&mut self.stream, &message)
            .await
            .expect("peer write failed");
    }

    async fn notify(&mut self, method: &str, args: Vec<Value>) {
        self.send(Message::Notification {
            method: method.to_string(),
            args,
        })
        .await;
    }

    async fn call(&mut self, id: u64, method: &str, args: Vec<Value>) {
        self.send(Message::Request {
            id,
            method: method.to_string(),
            args,
        })
        .await;
    }

    async fn reply(&mut self, id: u64, result: Value) {
        self.send(Message::Response {
            id,
            error: None,
            result,
        })
        .await;
    }

    /// Read a request for `method` and return its id and arguments.
    async fn expect_request(&mut self, method: &str) -> (u64, Vec<Value>) {
        match self.recv().await {
            Message::Request {
                id,
                method: got,
                args,
            } if got == method => (id, args),
            other => panic!("Expected request '{}', got {:?}", method, other),
        }
    }

    async fn expect_eof(&mut self) {
        match read_message(&mut self.stream, &mut self.decoder).await {
            Err(SessionError::Eof) => {}
            other => panic!("Expected EOF, got {:?}", other),
        }
    }
}

fn connect(config: SessionConfig) -> (Session, DuplexStream) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(client);
    let session =
        Session::from_transport(Transport::from_io(read, write), config).expect("session setup");
    (session, server)
}

fn spawn_peer<F, Fut>(stream: DuplexStream, script: F) -> JoinHandle<()>
where
    F: FnOnce(Peer) -> Fut + Send + 'static,
    Fut: Future<Output = ()>,
{
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Failed to build peer runtime");
        rt.block_on(async move {
            let peer = Peer {
                stream,
                decoder: MessageDecoder::default(),
            };
            tokio::time::timeout(PEER_TIMEOUT, script(peer))
                .await
                .expect("Peer script timed out");
        });
    })
}

async fn unexpected_request(_: Handle, method: String, _: Vec<Value>) -> Result<Value, HandlerError> {
    Err(HandlerError::UnknownMethod(method))
}

async fn stop_on_quit(handle: Handle, method: String, _: Vec<Value>) -> Result<(), HandlerError> {
    if method == "quit" {
        handle.stop();
    }
    Ok(())
}

#[test]
fn test_out_of_order_responses_reach_their_callers() {
    let (session, stream) = connect(SessionConfig::default());
    let peer = spawn_peer(stream, |mut peer| async move {
        let (first, _) = peer.expect_request("first").await;
        let (second, _) = peer.expect_request("second").await;
        peer.reply(second, Value::from("two")).await;
        peer.reply(first, Value::from("one")).await;
    });

    let results = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&results);
    session
        .run_with_setup(unexpected_request, stop_on_quit, move |handle: Handle| async move {
            let (a, b) = tokio::join!(
                handle.request("first", vec![]),
                handle.request("second", vec![])
            );
            *slot.borrow_mut() = Some((a?, b?));
            handle.stop();
            Ok::<(), HandlerError>(())
        })
        .expect("run failed");

    assert_eq!(
        results.borrow_mut().take(),
        Some((Value::from("one"), Value::from("two")))
    );
    peer.join().expect("peer script failed");
}

#[test]
fn test_traffic_during_blocking_request_is_replayed_in_order() {
    let (session, stream) = connect(SessionConfig::default());
    let peer = spawn_peer(stream, |mut peer| async move {
        let (id, args) = peer.expect_request("echo").await;
        assert_eq!(args, vec![Value::from("hi")]);
        peer.notify("X", vec![]).await;
        peer.call(7, "ping", vec![]).await;
        peer.notify("Z", vec![]).await;
        peer.reply(id, args[0].clone()).await;

        // Only answered once `run` replays the queue
        assert_eq!(
            peer.recv().await,
            Message::Response {
                id: 7,
                error: None,
                result: Value::from("ret"),
            }
        );
        peer.notify("done", vec![]).await;
        peer.expect_eof().await;
    });

    let reply = session
        .request("echo", vec![Value::from("hi")])
        .expect("echo failed");
    assert_eq!(reply, Value::from("hi"));
    assert_eq!(session.deferred_count(), 3);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let request_log = Rc::clone(&seen);
    let notification_log = Rc::clone(&seen);
    session
        .run(
            move |_handle: Handle, method: String, _args: Vec<Value>| {
                request_log.borrow_mut().push(method);
                async { Ok::<Value, HandlerError>(Value::from("ret")) }
            },
            move |handle: Handle, method: String, _args: Vec<Value>| {
                if method == "done" {
                    handle.stop();
                }
                notification_log.borrow_mut().push(method);
                async { Ok::<(), HandlerError>(()) }
            },
        )
        .expect("run failed");

    assert_eq!(*seen.borrow(), vec!["X", "ping", "Z", "done"]);
    assert_eq!(session.deferred_count(), 0);

    drop(session);
    peer.join().expect("peer script failed");
}

async fn nesting_handler(handle: Handle, method: String, _: Vec<Value>) -> Result<Value, HandlerError> {
    match method.as_str() {
        "outer" => {
            let inner = handle.request("inner", vec![]).await?;
            Ok(Value::from(format!("outer:{}", inner.as_str().unwrap_or("?"))))
        }
        "unrelated" => Ok(Value::from("b")),
        _ => Err(HandlerError::UnknownMethod(method)),
    }
}

#[test]
fn test_nested_request_while_serving_unrelated_request() {
    let (session, stream) = connect(SessionConfig::default());
    let peer = spawn_peer(stream, |mut peer| async move {
        peer.call(1, "outer", vec![]).await;
        let (inner_id, _) = peer.expect_request("inner").await;

        // The outer handler is suspended; the loop must still serve this one.
        peer.call(2, "unrelated", vec![]).await;
        assert_eq!(
            peer.recv().await,
            Message::Response {
                id: 2,
                error: None,
                result: Value::from("b"),
            }
        );

        peer.reply(inner_id, Value::from("deep")).await;
        assert_eq!(
            peer.recv().await,
            Message::Response {
                id: 1,
                error: None,
                result: Value::from("outer:deep"),
            }
        );
        peer.notify("quit", vec![]).await;
    });

    session
        .run(nesting_handler, stop_on_quit)
        .expect("run failed");
    peer.join().expect("peer script failed");
}

async fn failing_handler(_: Handle, method: String, _: Vec<Value>) -> Result<Value, HandlerError> {
    match method.as_str() {
        "refuse" => Err(HandlerError::Response(Value::Array(vec![
            Value::from(1),
            Value::from("refused"),
        ]))),
        "boom" => panic!("handler blew up"),
        "broken" => Err(anyhow::anyhow!("disk on fire").into()),
        _ => Err(HandlerError::UnknownMethod(method)),
    }
}

async fn failing_notification(handle: Handle, method: String, _: Vec<Value>) -> Result<(), HandlerError> {
    match method.as_str() {
        "quit" => {
            handle.stop();
            Ok(())
        }
        _ => Err(anyhow::anyhow!("cannot handle {}", method).into()),
    }
}

#[test]
fn test_failed_handlers_reply_exactly_once() {
    let reports: Rc<RefCell<Vec<DispatchError>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&reports);
    let config =
        SessionConfig::default().with_error_handler(move |err| sink.borrow_mut().push(err.clone()));
    let (session, stream) = connect(config);

    let peer = spawn_peer(stream, |mut peer| async move {
        for (id, method) in [(1, "refuse"), (2, "boom"), (3, "broken"), (4, "missing")] {
            peer.call(id, method, vec![]).await;
        }
        peer.notify("bad", vec![]).await;

        let mut replies = HashMap::new();
        for _ in 0..4 {
            match peer.recv().await {
                Message::Response { id, error, result } => {
                    assert_eq!(result, Value::Nil);
                    assert!(replies.insert(id, error).is_none(), "duplicate reply for {}", id);
                }
                other => panic!("Expected response, got {:?}", other),
            }
        }
        assert_eq!(
            replies[&1],
            Some(Value::Array(vec![Value::from(1), Value::from("refused")]))
        );
        assert_eq!(
            replies[&2],
            Some(Value::from("handler panicked: handler blew up"))
        );
        assert_eq!(replies[&3], Some(Value::from("disk on fire")));
        assert_eq!(
            replies[&4],
            Some(Value::from("no handler for method 'missing'"))
        );

        peer.notify("quit", vec![]).await;
        // Nothing else may be sent before the session goes away
        peer.expect_eof().await;
    });

    session
        .run(failing_handler, failing_notification)
        .expect("failures must not end the loop");
    drop(session);
    peer.join().expect("peer script failed");

    let mut reported: Vec<(DispatchKind, String)> = reports
        .borrow()
        .iter()
        .map(|r| (r.kind, r.method.clone()))
        .collect();
    reported.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        reported,
        vec![
            (DispatchKind::Notification, "bad".to_string()),
            (DispatchKind::Request, "boom".to_string()),
            (DispatchKind::Request, "broken".to_string()),
            (DispatchKind::Request, "missing".to_string()),
        ]
    );
}

#[test]
fn test_eof_fails_every_pending_call() {
    let (session, stream) = connect(SessionConfig::default());
    let peer = spawn_peer(stream, |mut peer| async move {
        peer.expect_request("a").await;
        peer.expect_request("b").await;
        // Dropping the stream hangs up on the session
    });

    let outcomes = Rc::new(RefCell::new(Vec::new()));
    let slot = Rc::clone(&outcomes);
    let result = session.run_with_setup(unexpected_request, stop_on_quit, move |handle: Handle| async move {
        let (a, b) = tokio::join!(handle.request("a", vec![]), handle.request("b", vec![]));
        slot.borrow_mut().extend([a, b]);
        Ok::<(), HandlerError>(())
    });
    peer.join().expect("peer script failed");

    assert!(matches!(result, Err(SessionError::Eof)));
    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|r| matches!(r, Err(SessionError::Eof))));

    // The connection stays dead
    assert!(matches!(
        session.request("again", vec![]),
        Err(SessionError::Eof)
    ));
}

#[test]
fn test_remote_error_is_returned_to_blocking_caller() {
    let (session, stream) = connect(SessionConfig::default());
    let peer = spawn_peer(stream, |mut peer| async move {
        let (id, _) = peer.expect_request("nvim_bogus").await;
        peer.send(Message::Response {
            id,
            error: Some(Value::Array(vec![Value::from(0), Value::from("Invalid method")])),
            result: Value::Nil,
        })
        .await;
    });

    match session.request("nvim_bogus", vec![]) {
        Err(SessionError::Remote(err)) => {
            assert_eq!(err.code(), Some(0));
            assert_eq!(err.message(), "Invalid method");
        }
        other => panic!("Expected remote error, got {:?}", other),
    }
    peer.join().expect("peer script failed");
}

#[test]
fn test_next_message_and_manual_reply() {
    let (session, stream) = connect(SessionConfig::default());
    let peer = spawn_peer(stream, |mut peer| async move {
        peer.call(3, "ask", vec![Value::from(1)]).await;
        assert_eq!(
            peer.recv().await,
            Message::Response {
                id: 3,
                error: None,
                result: Value::from(2),
            }
        );
    });

    let message = session
        .next_message()
        .expect("next_message failed")
        .expect("a message should arrive");
    match message {
        InboundMessage::Request {
            method,
            args,
            responder,
        } => {
            assert_eq!(method, "ask");
            let n = args[0].as_i64().unwrap_or(0);
            responder.send(Value::from(n + 1));
        }
        other => panic!("Expected request, got {:?}", other),
    }
    session.flush().expect("flush failed");
    peer.join().expect("peer script failed");
}

#[test]
fn test_next_message_returns_none_when_stopped_from_another_thread() {
    let (session, _stream) = connect(SessionConfig::default());
    let remote = session.threadsafe_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        remote.stop().expect("session should be alive");
    });

    let message = session.next_message().expect("next_message failed");
    assert!(message.is_none());
    stopper.join().expect("stopper thread panicked");
}

#[test]
fn test_threadsafe_call_can_make_requests() {
    let (session, stream) = connect(SessionConfig::default());
    let peer = spawn_peer(stream, |mut peer| async move {
        let (id, args) = peer.expect_request("from_thread").await;
        peer.reply(id, args[0].clone()).await;
    });

    let (tx, rx) = std::sync::mpsc::channel();
    let remote = session.threadsafe_handle();
    let worker = std::thread::spawn(move || {
        remote
            .call(move |handle| async move {
                let value = handle.request("from_thread", vec![Value::from(99)]).await?;
                tx.send(value).ok();
                handle.stop();
                anyhow::Ok(())
            })
            .expect("session should be alive");
    });

    session
        .run(unexpected_request, stop_on_quit)
        .expect("run failed");
    worker.join().expect("worker panicked");
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Value::from(99));
    peer.join().expect("peer script failed");
}

#[test]
fn test_usage_errors_after_close() {
    let (session, _stream) = connect(SessionConfig::default());
    session.close();
    assert!(session.is_closed());
    assert!(matches!(
        session.request("x", vec![]),
        Err(SessionError::Closed)
    ));
    assert!(matches!(
        session.post("x", vec![]),
        Err(SessionError::Closed)
    ));
    assert!(matches!(
        session.run(unexpected_request, stop_on_quit),
        Err(SessionError::Closed)
    ));
}
