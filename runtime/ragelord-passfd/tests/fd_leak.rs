//! Counts this process's open descriptors around failing transfers and
//! rehydrations. Kept in its own test binary with a single test so no other
//! test opens descriptors concurrently.
#![cfg(target_os = "linux")]

use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;

use ragelord_obj_model::HostLayout;
use ragelord_passfd::{
    AncillaryChannel, ChannelConfig, Family, HandleEnvelope, HandleKind, HostLimits, ManagedHost,
    Rehydrator,
};

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

fn socket_envelope() -> HandleEnvelope {
    HandleEnvelope::new(HandleKind::Socket, Family::Unix, true, 0)
}

#[test]
fn failures_close_every_descriptor_once() {
    let unsupported = Rehydrator::new(ManagedHost::new().unwrap())
        .with_supported_kinds([HandleKind::Stream]);
    let no_memory = Rehydrator::new(
        ManagedHost::with_limits(
            &HostLayout::compiled(),
            HostLimits {
                max_resources: Some(0),
                max_registered: None,
            },
        )
        .unwrap(),
    );
    let table_full = Rehydrator::new(
        ManagedHost::with_limits(
            &HostLayout::compiled(),
            HostLimits {
                max_resources: None,
                max_registered: Some(0),
            },
        )
        .unwrap(),
    );
    let (a, b) = UnixStream::pair().unwrap();
    let tx = AncillaryChannel::from_stream(a, ChannelConfig::default()).unwrap();
    let rx = AncillaryChannel::from_stream(
        b,
        ChannelConfig {
            control_capacity: 0,
            ..ChannelConfig::default()
        },
    )
    .unwrap();

    let before = open_descriptors();
    for _ in 0..200 {
        for rehydrator in [&unsupported, &no_memory, &table_full] {
            let (ours, _theirs) = UnixStream::pair().unwrap();
            assert!(rehydrator.rehydrate(OwnedFd::from(ours), socket_envelope()).is_err());
        }

        let (ours, _theirs) = UnixStream::pair().unwrap();
        tx.send(ours.as_fd(), b"dropped").unwrap();
        assert!(rx.receive().is_err());
    }
    assert_eq!(open_descriptors(), before);
}
