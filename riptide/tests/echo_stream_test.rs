// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! End-to-end bytestream scenarios over connected socket pairs.

use std::{cell::RefCell,
          os::fd::OwnedFd,
          rc::Rc,
          time::{Duration, Instant}};

use riptide::{ByteStream, ConsumeOutcome, Reactor, StreamContext};
use rustix::net::{AddressFamily, SocketFlags, SocketType};

fn socket_pair() -> (OwnedFd, OwnedFd) {
    rustix::net::socketpair(
        AddressFamily::UNIX,
        SocketType::STREAM,
        SocketFlags::CLOEXEC,
        None,
    )
    .unwrap()
}

/// Consumer that splits on `\n` and echoes each complete line back.
fn echo_lines(cx: &mut StreamContext<'_>, _eof: bool) -> miette::Result<ConsumeOutcome> {
    match cx.buffer().iter().position(|&b| b == b'\n') {
        Some(at) => {
            let line: Vec<u8> = cx.buffer().drain(..=at).collect();
            cx.write(&line);
            Ok(ConsumeOutcome::Again)
        }
        None => Ok(ConsumeOutcome::NeedMore),
    }
}

/// Consumer that moves everything it sees into a shared sink.
fn collect_into(
    sink: Rc<RefCell<Vec<u8>>>,
) -> impl FnMut(&mut StreamContext<'_>, bool) -> miette::Result<ConsumeOutcome> {
    move |cx, _eof| {
        sink.borrow_mut().extend_from_slice(cx.buffer());
        cx.buffer().clear();
        Ok(ConsumeOutcome::NeedMore)
    }
}

fn run_until(reactor: &mut Reactor, deadline: Duration, mut done: impl FnMut() -> bool) {
    let stop_at = Instant::now() + deadline;
    while !done() {
        assert!(Instant::now() < stop_at, "scenario timed out");
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
}

#[test]
fn test_echo_line_round_trip() {
    let mut reactor = Reactor::new().unwrap();
    let (echo_end, client_end) = socket_pair();

    let echo = ByteStream::builder()
        .socket(echo_end)
        .consumer(echo_lines)
        .build()
        .unwrap();
    let echo_id = reactor.attach(echo).unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let client = ByteStream::builder()
        .socket(client_end)
        .consumer(collect_into(received.clone()))
        .build()
        .unwrap();
    let client_id = reactor.attach(client).unwrap();

    // Attached read interest is visible in the backend mask.
    assert!(reactor.role_of(echo_id).is_some());
    assert!(reactor.role_of(client_id).is_some());

    reactor.stream_write(client_id, b"hello\nworld\n").unwrap();
    run_until(&mut reactor, Duration::from_secs(5), || {
        received.borrow().len() >= 12
    });

    // Both lines came back, with no residual bytes.
    assert_eq!(received.borrow().as_slice(), b"hello\nworld\n");
    reactor.run_once(Some(Duration::from_millis(20))).unwrap();
    assert_eq!(received.borrow().as_slice(), b"hello\nworld\n");
}

#[test]
fn test_partial_line_waits_for_newline() {
    let mut reactor = Reactor::new().unwrap();
    let (echo_end, client_end) = socket_pair();

    let echo = ByteStream::builder()
        .socket(echo_end)
        .consumer(echo_lines)
        .build()
        .unwrap();
    reactor.attach(echo).unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let client = ByteStream::builder()
        .socket(client_end)
        .consumer(collect_into(received.clone()))
        .build()
        .unwrap();
    let client_id = reactor.attach(client).unwrap();

    reactor.stream_write(client_id, b"no newline yet").unwrap();
    for _ in 0..5 {
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
    assert!(received.borrow().is_empty());

    reactor.stream_write(client_id, b"\n").unwrap();
    run_until(&mut reactor, Duration::from_secs(5), || {
        !received.borrow().is_empty()
    });
    assert_eq!(received.borrow().as_slice(), b"no newline yet\n");
}

#[test]
fn test_stream_over_regular_file_reads_to_eof() {
    use std::io::Write;

    let mut reactor = Reactor::new().unwrap();
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"file contents, synthesized readiness").unwrap();
    // Rewind so the stream reads from the start.
    rustix::fs::seek(&file, rustix::fs::SeekFrom::Start(0)).unwrap();

    let collected = Rc::new(RefCell::new(Vec::new()));
    let saw_eof = Rc::new(std::cell::Cell::new(false));

    let sink = collected.clone();
    let eof_flag = saw_eof.clone();
    let stream = ByteStream::builder()
        .read_fd(OwnedFd::from(file))
        .consumer(move |cx: &mut StreamContext<'_>, eof: bool| {
            sink.borrow_mut().extend_from_slice(cx.buffer());
            cx.buffer().clear();
            if eof {
                eof_flag.set(true);
            }
            Ok(ConsumeOutcome::NeedMore)
        })
        .build()
        .unwrap();
    reactor.attach(stream).unwrap();

    run_until(&mut reactor, Duration::from_secs(5), || saw_eof.get());
    assert_eq!(
        collected.borrow().as_slice(),
        b"file contents, synthesized readiness"
    );
}
