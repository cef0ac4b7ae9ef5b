// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Reflecting chat broadcast: three server-side streams share a client set; a
//! line arriving on one is reflected to the other two, prefixed with the
//! sender's name, and never back to the writer.

use std::{cell::RefCell,
          os::fd::OwnedFd,
          rc::Rc,
          time::{Duration, Instant}};

use miette::IntoDiagnostic;
use riptide::{ByteStream, ConsumeOutcome, NotifierId, Reactor, StreamContext};
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

#[test]
fn test_line_reflects_to_all_peers_but_not_writer() {
    let mut reactor = Reactor::new().unwrap();
    let peers: Rc<RefCell<Vec<NotifierId>>> = Rc::new(RefCell::new(Vec::new()));

    let mut client_sinks = Vec::new();
    let mut client_ids = Vec::new();

    for name in ["alice", "bob", "carol"] {
        let (server_end, client_end) = socket_pair();

        // Server side: reflect complete lines to every *other* server stream.
        let peer_set = peers.clone();
        let server = ByteStream::builder()
            .socket(server_end)
            .consumer(move |cx: &mut StreamContext<'_>,
                           _eof: bool|
                  -> miette::Result<ConsumeOutcome> {
                let Some(at) = cx.buffer().iter().position(|&b| b == b'\n') else {
                    return Ok(ConsumeOutcome::NeedMore);
                };
                let line: Vec<u8> = cx.buffer().drain(..=at).collect();
                let mut reflected = format!("<{name}>: ").into_bytes();
                reflected.extend_from_slice(&line);
                let own = cx.stream_id();
                let targets: Vec<NotifierId> = peer_set
                    .borrow()
                    .iter()
                    .copied()
                    .filter(|peer| *peer != own)
                    .collect();
                for peer in targets {
                    cx.reactor().stream_write(peer, &reflected).into_diagnostic()?;
                }
                Ok(ConsumeOutcome::Again)
            })
            .build()
            .unwrap();
        let server_id = reactor.attach(server).unwrap();
        peers.borrow_mut().push(server_id);

        // Client side: collect whatever arrives.
        let sink = Rc::new(RefCell::new(Vec::<u8>::new()));
        let collect = sink.clone();
        let client = ByteStream::builder()
            .socket(client_end)
            .consumer(move |cx: &mut StreamContext<'_>,
                           _eof: bool|
                  -> miette::Result<ConsumeOutcome> {
                collect.borrow_mut().extend_from_slice(cx.buffer());
                cx.buffer().clear();
                Ok(ConsumeOutcome::NeedMore)
            })
            .build()
            .unwrap();
        client_ids.push(reactor.attach(client).unwrap());
        client_sinks.push(sink);
    }

    // Alice says "a".
    reactor.stream_write(client_ids[0], b"a\n").unwrap();

    let expected = b"<alice>: a\n";
    let stop_at = Instant::now() + Duration::from_secs(5);
    while client_sinks[1].borrow().len() < expected.len()
        || client_sinks[2].borrow().len() < expected.len()
    {
        assert!(Instant::now() < stop_at, "broadcast timed out");
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }

    assert_eq!(client_sinks[1].borrow().as_slice(), expected);
    assert_eq!(client_sinks[2].borrow().as_slice(), expected);

    // A few extra iterations: the writer still receives nothing.
    for _ in 0..5 {
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
    assert!(client_sinks[0].borrow().is_empty());
}
