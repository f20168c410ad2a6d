use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;

use ragelord_passfd::handover::send_handover_with_config;
use ragelord_passfd::{
    ChannelConfig, ChannelError, HandleKind, HandoverError, HandoverReceiver, ManagedHost,
    Persistence, Rehydrator, ResourceKind, send_handover,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Session {
    nick: String,
    channels: Vec<String>,
}

#[test]
fn handover_carries_socket_and_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upgrade.sock");
    let receiver = HandoverReceiver::bind(&path).unwrap();

    let (mut client, server_side) = UnixStream::pair().unwrap();
    let session = Session {
        nick: "ragelord".to_string(),
        channels: vec!["#rust".to_string(), "#irc".to_string()],
    };

    std::thread::scope(|scope| {
        let sender = scope.spawn(|| send_handover(&path, server_side.as_fd(), &session));

        let handover = receiver.receive::<Session>().unwrap();
        sender.join().unwrap().unwrap();
        assert!(!path.exists());
        assert_eq!(handover.context, session);
        assert_eq!(handover.envelope.kind(), HandleKind::Socket);

        let host = ManagedHost::new().unwrap();
        let rehydrator = Rehydrator::new(host.clone()).with_persistence(Persistence::Persistent);
        let (mut handle, context) = handover.rehydrate(&rehydrator).unwrap();
        assert_eq!(context.nick, "ragelord");
        assert_eq!(handle.kind(), Some(ResourceKind::PersistentSocket));

        client.write_all(b"NICK ragelord\r\n").unwrap();
        let mut buf = [0u8; 15];
        handle.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"NICK ragelord\r\n");
    });
}

#[test]
fn handover_context_defaults_to_json_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("value.sock");
    let receiver = HandoverReceiver::bind(&path).unwrap();
    let file = tempfile::tempfile().unwrap();

    std::thread::scope(|scope| {
        let sender = scope.spawn(|| {
            send_handover(&path, file.as_fd(), &serde_json::json!({ "clients": 3 }))
        });
        let handover = receiver.receive::<serde_json::Value>().unwrap();
        sender.join().unwrap().unwrap();
        assert_eq!(handover.envelope.kind(), HandleKind::Stream);
        assert_eq!(handover.context["clients"], 3);
    });
}

#[test]
fn mismatched_context_is_a_context_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mismatch.sock");
    let receiver = HandoverReceiver::bind(&path).unwrap();
    let file = tempfile::tempfile().unwrap();

    std::thread::scope(|scope| {
        let sender = scope.spawn(|| send_handover(&path, file.as_fd(), &[1, 2, 3]));
        let result = receiver.receive::<Session>();
        sender.join().unwrap().unwrap();
        assert!(matches!(result, Err(HandoverError::Context(_))));
    });
}

#[test]
fn oversized_context_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.sock");
    let receiver = HandoverReceiver::bind(&path).unwrap();
    let file = tempfile::tempfile().unwrap();
    let config = ChannelConfig {
        max_payload: 32,
        ..ChannelConfig::default()
    };
    let big = "x".repeat(64);
    let err = send_handover_with_config(receiver.path(), file.as_fd(), &big, config)
        .unwrap_err();
    assert!(matches!(
        err,
        HandoverError::Channel(ChannelError::PayloadTooLarge { max: 32, .. })
    ));
}

#[test]
fn failed_handover_leaves_connection_with_sender() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nobody.sock");
    let (mut client, server_side) = UnixStream::pair().unwrap();

    let err = send_handover(&path, server_side.as_fd(), &()).unwrap_err();
    assert!(matches!(err, HandoverError::Channel(_)));

    let mut server_side = server_side;
    server_side.write_all(b"PING :still here\r\n").unwrap();
    let mut buf = [0u8; 18];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"PING :still here\r\n");

    // A replacement that comes up later still gets the same connection.
    let receiver = HandoverReceiver::bind(&path).unwrap();
    std::thread::scope(|scope| {
        let sender = scope.spawn(|| send_handover(&path, server_side.as_fd(), &()));
        let handover = receiver.receive::<()>().unwrap();
        sender.join().unwrap().unwrap();

        let mut received = UnixStream::from(handover.fd);
        client.write_all(b"PONG").unwrap();
        let mut pong = [0u8; 4];
        received.read_exact(&mut pong).unwrap();
        assert_eq!(&pong, b"PONG");
    });
}
