use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rbb_protocol::{Command, codec::ClientCodec};
use rbb_server::{Capabilities, bridge::SessionEnd, server::Builder, sim::LoopbackBus};
use rbb_tests::{delayed_by_one, shift_commands};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

#[tokio::test]
async fn samples_arrive_in_order_under_backpressure() {
    let mut server = Builder::new()
        .fifo_depth(2)
        .chunk_size(3)
        .build(LoopbackBus::new(Capabilities::default()))
        .unwrap();
    let (client, stream) = tokio::io::duplex(16);
    let (rx, tx) = tokio::io::split(client);
    let mut samples = FramedRead::new(rx, ClientCodec);
    let mut commands = FramedWrite::new(tx, ClientCodec);

    let tdi: Vec<bool> = (0..200).map(|i| i % 3 == 0 || i % 7 == 0).collect();
    let peer = async {
        let send = async {
            for command in shift_commands(&tdi) {
                commands.feed(command).await.unwrap();
            }
            commands.flush().await.unwrap();
        };
        let receive = async {
            let mut tdo = Vec::new();
            while tdo.len() < tdi.len() {
                tdo.push(samples.next().await.unwrap().unwrap());
            }
            tdo
        };
        let ((), tdo) = tokio::join!(send, receive);
        // Closing both halves closes the stream
        drop(commands);
        drop(samples);
        tdo
    };

    let (end, tdo) = tokio::join!(server.run_session(stream, CancellationToken::new()), peer);
    assert_eq!(end.unwrap(), SessionEnd::PeerClosed);
    assert_eq!(tdo, delayed_by_one(&tdi));
    assert_eq!(server.bus().rising_edges(), 200);
}

#[tokio::test]
async fn quit_does_not_end_session() {
    let mut server = Builder::new()
        .build(LoopbackBus::new(Capabilities::default()))
        .unwrap();
    let (mut client, stream) = tokio::io::duplex(64);

    let peer = async {
        client.write_all(b"15QR").await.unwrap();
        let mut sample = [0u8; 1];
        client.read_exact(&mut sample).await.unwrap();
        drop(client);
        sample
    };
    let (end, sample) = tokio::join!(server.run_session(stream, CancellationToken::new()), peer);
    assert_eq!(end.unwrap(), SessionEnd::PeerClosed);
    assert_eq!(&sample, b"1");
}

#[tokio::test]
async fn unknown_command_stalls_session_until_cancelled() {
    let mut server = Builder::new()
        .build(LoopbackBus::new(Capabilities::default()))
        .unwrap();
    let (mut client, stream) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();

    let peer = async {
        client.write_all(b"R?R").await.unwrap();
        let mut sample = [0u8; 1];
        client.read_exact(&mut sample).await.unwrap();
        let mut more = [0u8; 1];
        let stalled =
            tokio::time::timeout(Duration::from_millis(50), client.read(&mut more)).await;
        assert!(stalled.is_err(), "no sample after an unknown command");
        cancel.cancel();
        client
    };
    let (end, _client) = tokio::join!(server.run_session(stream, cancel.clone()), peer);
    assert_eq!(end.unwrap(), SessionEnd::Cancelled);
}

#[tokio::test]
async fn reset_and_indicator_reach_the_bus() {
    let mut server = Builder::new()
        .build(LoopbackBus::new(Capabilities::full()))
        .unwrap();
    let (client, stream) = tokio::io::duplex(64);
    let (rx, tx) = tokio::io::split(client);
    let mut samples = FramedRead::new(rx, ClientCodec);
    let mut commands = FramedWrite::new(tx, ClientCodec);

    let peer = async {
        for command in [
            Command::Reset {
                trst: true,
                srst: false,
            },
            Command::Blink(true),
            Command::Sample,
        ] {
            commands.send(command).await.unwrap();
        }
        // The sample is answered after the preceding commands took effect
        assert!(!samples.next().await.unwrap().unwrap());
        drop(commands);
        drop(samples);
    };
    let (end, ()) = tokio::join!(server.run_session(stream, CancellationToken::new()), peer);
    assert_eq!(end.unwrap(), SessionEnd::PeerClosed);

    let bus = server.bus();
    assert!(bus.signals().trst);
    assert!(!bus.signals().srst);
    assert!(bus.indicator());
}
