//! Integration tests for dvalue-debugger.
//!
//! A fake target sits on the other end of an in-memory duplex stream and
//! answers requests through the public [`Debugger`] API.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use dvalue_debugger::protocol::{command, DumpSink, ParserEvent, StreamParser};
use dvalue_debugger::session::{Breakpoint, ExecState, HeapBody, LogKind};
use dvalue_debugger::transport::{Connector, FnConnector, TargetStream};
use dvalue_debugger::{Debugger, DebuggerError, DebuggerEvent, Dvalue, EventKind, Message};

const WAIT: Duration = Duration::from_secs(5);

/// Target side of the connection.
struct FakeTarget {
    stream: DuplexStream,
    parser: StreamParser,
    inbox: VecDeque<Message>,
}

impl FakeTarget {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            parser: StreamParser::without_handshake(DumpSink::default()),
            inbox: VecDeque::new(),
        }
    }

    async fn handshake(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
    }

    /// Next request written by the debugger.
    async fn next(&mut self) -> Message {
        loop {
            if let Some(msg) = self.inbox.pop_front() {
                return msg;
            }
            let mut buf = [0u8; 4096];
            let n = timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("no request from debugger")
                .unwrap();
            assert!(n > 0, "debugger closed the connection");
            for event in self.parser.push(&buf[..n]).unwrap() {
                if let ParserEvent::Message(msg) = event {
                    self.inbox.push_back(msg);
                }
            }
        }
    }

    /// Next request, which must be `cmd`.
    async fn expect(&mut self, cmd: i32) -> Message {
        let msg = self.next().await;
        assert_eq!(msg.command(), Some(cmd), "unexpected request {}", msg);
        msg
    }

    async fn send(&mut self, values: Vec<Dvalue>) {
        let data = Message::new(values).encode().unwrap();
        self.stream.write_all(&data).await.unwrap();
    }

    async fn reply(&mut self, payload: Vec<Dvalue>) {
        let mut values = vec![Dvalue::Rep];
        values.extend(payload);
        self.send(values).await;
    }

    async fn error(&mut self, code: i32, description: &str) {
        self.send(vec![Dvalue::Err, Dvalue::Int(code), Dvalue::str(description)])
            .await;
    }

    async fn notify(&mut self, cmd: i32, payload: Vec<Dvalue>) {
        let mut values = vec![Dvalue::Nfy, Dvalue::Int(cmd)];
        values.extend(payload);
        self.send(values).await;
    }

    /// Wait until the debugger side of the stream is gone.
    async fn closed(&mut self) -> bool {
        let mut buf = [0u8; 256];
        loop {
            match timeout(WAIT, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}

/// Connector handing out one duplex stream.
fn one_shot(stream: DuplexStream) -> impl Connector {
    let slot = Arc::new(Mutex::new(Some(stream)));
    FnConnector::new(move || {
        let stream = slot.lock().unwrap().take();
        std::future::ready(
            stream
                .map(|s| Box::new(s) as Box<dyn TargetStream>)
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "already used")),
        )
    })
}

/// Spawn a debugger and wait for the whole attach sequence.
async fn attach() -> (Debugger, FakeTarget) {
    attach_with(|builder| builder).await
}

async fn attach_with(
    configure: impl FnOnce(dvalue_debugger::DebuggerBuilder) -> dvalue_debugger::DebuggerBuilder,
) -> (Debugger, FakeTarget) {
    let (client, target) = duplex(64 * 1024);
    let builder = Debugger::builder()
        .connector(one_shot(client))
        .poll_interval(Duration::from_secs(3600));
    let debugger = configure(builder).spawn();
    let mut info = debugger.subscribe_to([EventKind::BasicInfoChanged]);
    let mut target = FakeTarget::new(target);

    debugger.connect().await.unwrap();
    target.handshake("1 10500 v1.5.0 fake target\n").await;
    target.expect(command::BASIC_INFO).await;
    target
        .reply(vec![
            Dvalue::Int(10500),
            Dvalue::str("v1.5.0"),
            Dvalue::str("fake"),
            Dvalue::Int(1),
        ])
        .await;

    timeout(WAIT, info.recv()).await.unwrap().unwrap();
    (debugger, target)
}

#[tokio::test]
async fn test_attach_sequence() {
    let (debugger, _target) = attach().await;

    let state = debugger.snapshot().await.unwrap();
    assert!(state.attached);
    assert!(state.handshook);
    assert_eq!(state.protocol_version, Some(1));
    assert_eq!(state.version_identification.as_deref(), Some("10500 v1.5.0 fake target"));
    assert_eq!(state.exec_status.state, ExecState::Running);
    assert_eq!(state.basic_info.unwrap().target_info, "fake");

    let lines: Vec<_> = state.output.iter().map(|l| l.message.as_str()).collect();
    assert!(lines.contains(&"Debug transport connected"));
    assert!(lines.contains(&"Debug protocol version: 1"));
}

#[tokio::test]
async fn test_get_var_end_to_end() {
    let (debugger, mut target) = attach().await;

    let target_side = async {
        let request = target.expect(command::GET_VAR).await;
        assert_eq!(
            request.values(),
            &[Dvalue::Req, Dvalue::Int(0x1a), Dvalue::str("length")]
        );
        target.reply(vec![Dvalue::Int(1), Dvalue::Int(42)]).await;
    };

    let (result, ()) = tokio::join!(debugger.get_var("length"), target_side);
    let result = result.unwrap();
    assert!(result.found);
    assert_eq!(result.value, Dvalue::Int(42));
}

#[tokio::test]
async fn test_replies_settle_in_send_order() {
    let (debugger, mut target) = attach().await;
    let mut prints = debugger.subscribe_to([EventKind::LogLine]);

    let target_side = async {
        for name in ["a", "b", "c"] {
            let request = target.expect(command::GET_VAR).await;
            assert_eq!(request.string(2).as_deref(), Some(name));
        }
        target.reply(vec![Dvalue::Int(1), Dvalue::Int(1)]).await;
        target.notify(command::PRINT, vec![Dvalue::str("between")]).await;
        target.error(3, "not found").await;
        target.notify(command::ALERT, vec![Dvalue::str("again")]).await;
        target.reply(vec![Dvalue::Int(1), Dvalue::Int(3)]).await;
    };

    let (a, b, c, ()) = tokio::join!(
        debugger.get_var("a"),
        debugger.get_var("b"),
        debugger.get_var("c"),
        target_side
    );

    assert_eq!(a.unwrap().value, Dvalue::Int(1));
    match b {
        Err(DebuggerError::Target { code, description }) => {
            assert_eq!(code, 3);
            assert_eq!(description, "not found");
        }
        other => panic!("expected target error, got {:?}", other),
    }
    assert_eq!(c.unwrap().value, Dvalue::Int(3));

    let mut seen = Vec::new();
    while seen.len() < 2 {
        if let DebuggerEvent::LogLine(line) = timeout(WAIT, prints.recv()).await.unwrap().unwrap() {
            if line.kind != LogKind::DebuggerInfo {
                seen.push((line.kind, line.message));
            }
        }
    }
    assert_eq!(
        seen,
        vec![
            (LogKind::Print, "between".to_string()),
            (LogKind::Alert, "again".to_string())
        ]
    );
}

#[tokio::test]
async fn test_toggle_breakpoint_adds_then_removes() {
    let (debugger, mut target) = attach().await;

    let add_side = async {
        target.expect(command::LIST_BREAK).await;
        target.reply(vec![]).await;
        let add = target.expect(command::ADD_BREAK).await;
        assert_eq!(add.string(2).as_deref(), Some("a.js"));
        assert_eq!(add.int(3), Some(10));
        target.reply(vec![Dvalue::Int(0)]).await;
        target.expect(command::LIST_BREAK).await;
        target.reply(vec![Dvalue::str("a.js"), Dvalue::Int(10)]).await;
    };
    let (list, ()) = tokio::join!(debugger.toggle_breakpoint("a.js", 10), add_side);
    assert_eq!(
        list.unwrap(),
        vec![Breakpoint {
            file_name: "a.js".to_string(),
            line: 10
        }]
    );

    let remove_side = async {
        target.expect(command::LIST_BREAK).await;
        target
            .reply(vec![
                Dvalue::str("a.js"),
                Dvalue::Int(10),
                Dvalue::str("b.js"),
                Dvalue::Int(5),
                Dvalue::str("a.js"),
                Dvalue::Int(10),
            ])
            .await;
        assert_eq!(target.expect(command::DEL_BREAK).await.int(2), Some(2));
        target.reply(vec![]).await;
        assert_eq!(target.expect(command::DEL_BREAK).await.int(2), Some(0));
        target.reply(vec![]).await;
        target.expect(command::LIST_BREAK).await;
        target.reply(vec![Dvalue::str("b.js"), Dvalue::Int(5)]).await;
    };
    let (list, ()) = tokio::join!(debugger.toggle_breakpoint("a.js", 10), remove_side);
    let list = list.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].file_name, "b.js");

    assert_eq!(debugger.snapshot().await.unwrap().breakpoints, list);
}

#[tokio::test]
async fn test_unsupported_version_closes_connection() {
    let (client, target) = duplex(4096);
    let debugger = Debugger::builder().connector(one_shot(client)).spawn();
    let mut detached = debugger.subscribe_to([EventKind::Detached]);
    let mut target = FakeTarget::new(target);

    debugger.connect().await.unwrap();
    target.handshake("2 20000 from the future\n").await;

    assert_eq!(
        timeout(WAIT, detached.recv()).await.unwrap().unwrap(),
        DebuggerEvent::Detached
    );
    assert!(target.closed().await);

    let state = debugger.snapshot().await.unwrap();
    assert!(!state.handshook);
    assert!(!state.attached);
    assert_eq!(state.protocol_version, Some(2));
    assert!(state
        .output
        .iter()
        .any(|l| l.message == "Protocol version 2 unsupported, dropping connection"));
}

#[tokio::test]
async fn test_garbage_after_handshake_closes_connection() {
    let (client, target) = duplex(4096);
    let debugger = Debugger::builder().connector(one_shot(client)).spawn();
    let mut detached = debugger.subscribe_to([EventKind::Detached]);
    let mut target = FakeTarget::new(target);

    debugger.connect().await.unwrap();
    target.handshake("1 10500 fake\n").await;
    target.expect(command::BASIC_INFO).await;
    // 0x05 is not a dvalue tag
    target.stream.write_all(&[0x05]).await.unwrap();

    timeout(WAIT, detached.recv()).await.unwrap().unwrap();
    assert!(!debugger.snapshot().await.unwrap().attached);
}

#[tokio::test]
async fn test_eval_refreshes_locals() {
    let (debugger, mut target) = attach().await;
    let mut locals = debugger.subscribe_to([EventKind::LocalsChanged]);

    let target_side = async {
        let eval = target.expect(command::EVAL).await;
        assert_eq!(eval.string(2).as_deref(), Some("x + 1"));
        target.expect(command::GET_LOCALS).await;
        target.reply(vec![Dvalue::Int(0), Dvalue::Number(3.5)]).await;
        target.reply(vec![Dvalue::str("x"), Dvalue::Number(2.5)]).await;
    };
    let (result, ()) = tokio::join!(debugger.eval("x + 1"), target_side);
    let result = result.unwrap();
    assert!(!result.error);
    assert_eq!(result.value, Dvalue::Number(3.5));

    match timeout(WAIT, locals.recv()).await.unwrap().unwrap() {
        DebuggerEvent::LocalsChanged(locals) => {
            assert_eq!(locals.len(), 1);
            assert_eq!(locals[0].key, "x");
            assert_eq!(locals[0].value, "2.5");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_paused_status_refreshes_state() {
    let (debugger, mut target) = attach().await;
    let mut status = debugger.subscribe_to([EventKind::ExecStatusChanged, EventKind::CallStackChanged]);

    target
        .notify(
            command::STATUS,
            vec![
                Dvalue::Int(1),
                Dvalue::str("app.js"),
                Dvalue::str("loop"),
                Dvalue::Int(7),
                Dvalue::Int(21),
            ],
        )
        .await;

    target.expect(command::LIST_BREAK).await;
    target.expect(command::GET_LOCALS).await;
    target.expect(command::GET_CALL_STACK).await;
    target.reply(vec![]).await;
    target.reply(vec![]).await;
    target
        .reply(vec![
            Dvalue::str("app.js"),
            Dvalue::str("loop"),
            Dvalue::Int(7),
            Dvalue::Int(21),
        ])
        .await;

    match timeout(WAIT, status.recv()).await.unwrap().unwrap() {
        DebuggerEvent::ExecStatusChanged(s) => {
            assert_eq!(s.state, ExecState::Paused);
            assert_eq!(s.func_name, "loop");
            assert_eq!(s.pc, 21);
        }
        other => panic!("unexpected event {:?}", other),
    }
    match timeout(WAIT, status.recv()).await.unwrap().unwrap() {
        DebuggerEvent::CallStackChanged(frames) => assert_eq!(frames[0].line, 7),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_dump_heap() {
    let (debugger, mut target) = attach().await;

    let target_side = async {
        target.expect(command::DUMP_HEAP).await;
        target
            .reply(vec![
                Dvalue::Heapptr {
                    ptr: Bytes::from_static(&[0xde, 0xad]),
                },
                Dvalue::Int(1),
                Dvalue::Int(0),
                Dvalue::Int(1),
                Dvalue::Int(2),
                Dvalue::Int(2),
                Dvalue::Int(99),
                Dvalue::str("hi"),
            ])
            .await;
    };
    let (dump, ()) = tokio::join!(debugger.dump_heap(), target_side);
    let dump = dump.unwrap();

    assert_eq!(dump.heap_objects.len(), 1);
    assert_eq!(dump.heap_objects[0].refc, 1);
    assert!(matches!(
        &dump.heap_objects[0].body,
        HeapBody::String { data, .. } if *data == Dvalue::str("hi")
    ));
}

#[tokio::test]
async fn test_detach_waits_for_reply_then_disconnects() {
    let (debugger, mut target) = attach().await;
    let mut detached = debugger.subscribe_to([EventKind::Detached]);

    let target_side = async {
        target.expect(command::DETACH).await;
        target.reply(vec![]).await;
    };
    let (result, ()) = tokio::join!(debugger.detach(), target_side);
    result.unwrap();

    timeout(WAIT, detached.recv()).await.unwrap().unwrap();
    assert!(target.closed().await);
    assert_eq!(
        debugger.snapshot().await.unwrap().exec_status.state,
        ExecState::Detached
    );
    assert!(matches!(debugger.resume().await, Err(DebuggerError::InvalidState)));
}

#[tokio::test]
async fn test_detach_gives_up_after_timeout() {
    let (debugger, mut target) = attach_with(|b| b.detach_timeout(Duration::from_millis(50))).await;

    // The target never answers; the connection is dropped anyway
    assert!(matches!(debugger.detach().await, Err(DebuggerError::Timeout)));
    target.expect(command::DETACH).await;
    assert!(target.closed().await);
    assert!(!debugger.snapshot().await.unwrap().attached);
}

#[tokio::test]
async fn test_pending_request_fails_on_disconnect() {
    let (debugger, mut target) = attach().await;

    let target_side = async {
        target.expect(command::PAUSE).await;
        debugger.disconnect().await.unwrap();
    };
    let (result, ()) = tokio::join!(debugger.pause(), target_side);
    assert!(matches!(result, Err(DebuggerError::Disconnected)));
}
