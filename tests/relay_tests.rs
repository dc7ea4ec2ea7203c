//! Transparent relay behavior over in-memory and loopback streams

use std::time::Duration;
use tapwire::relay::{relay, Metered};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn test_large_transfer_is_exact_both_ways() {
    let (client_remote, client) = duplex(4096);
    let (origin, origin_remote) = duplex(4096);
    let relay_task = tokio::spawn(relay(client, origin, 1024));

    let upload = pattern(1 << 20, 7);
    let download = pattern(3 << 19, 91);

    let (mut client_read, mut client_write) = tokio::io::split(client_remote);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin_remote);

    let sent_up = upload.clone();
    let writer_up = tokio::spawn(async move {
        client_write.write_all(&sent_up).await.unwrap();
        client_write.shutdown().await.unwrap();
    });
    let sent_down = download.clone();
    let writer_down = tokio::spawn(async move {
        origin_write.write_all(&sent_down).await.unwrap();
        origin_write.shutdown().await.unwrap();
    });

    let reader_up = tokio::spawn(async move {
        let mut out = Vec::new();
        origin_read.read_to_end(&mut out).await.unwrap();
        out
    });
    let reader_down = tokio::spawn(async move {
        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        out
    });

    writer_up.await.unwrap();
    writer_down.await.unwrap();
    assert_eq!(reader_up.await.unwrap(), upload);
    assert_eq!(reader_down.await.unwrap(), download);

    let stats = relay_task.await.unwrap().unwrap();
    assert_eq!(stats.client_to_origin, upload.len() as u64);
    assert_eq!(stats.origin_to_client, download.len() as u64);
}

#[tokio::test]
async fn test_slow_reader_applies_backpressure() {
    let (mut client_remote, client) = duplex(64 * 1024);
    let (origin, mut origin_remote) = duplex(256);
    let relay_task = tokio::spawn(relay(client, origin, 128));

    // The origin does not read; the writer must stall rather than the relay buffering everything
    let payload = pattern(256 * 1024, 3);
    let sent = payload.clone();
    let writer = tokio::spawn(async move {
        client_remote.write_all(&sent).await.unwrap();
        client_remote
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!writer.is_finished());

    let mut received = vec![0u8; payload.len()];
    origin_remote.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);

    let mut client_remote = writer.await.unwrap();
    client_remote.shutdown().await.unwrap();
    origin_remote.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client_remote.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let stats = relay_task.await.unwrap().unwrap();
    assert_eq!(stats.client_to_origin, payload.len() as u64);
}

#[tokio::test]
async fn test_half_close_keeps_other_direction_open() {
    let (mut client_remote, client) = duplex(256);
    let (origin, mut origin_remote) = duplex(256);
    let relay_task = tokio::spawn(relay(client, origin, 64));

    client_remote.write_all(b"last words").await.unwrap();
    client_remote.shutdown().await.unwrap();

    let mut at_origin = Vec::new();
    origin_remote.read_to_end(&mut at_origin).await.unwrap();
    assert_eq!(at_origin, b"last words");

    // Origin still answers after the client stopped sending
    origin_remote.write_all(b"reply after eof").await.unwrap();
    origin_remote.shutdown().await.unwrap();

    let mut at_client = Vec::new();
    client_remote.read_to_end(&mut at_client).await.unwrap();
    assert_eq!(at_client, b"reply after eof");

    relay_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_metered_tcp_relay_matches_stats() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin_listener.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut socket, _) = origin_listener.accept().await.unwrap();
        let mut request = Vec::new();
        socket.read_to_end(&mut request).await.unwrap();
        socket.write_all(&request).await.unwrap();
        socket.write_all(b"!").await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front.local_addr().unwrap();
    let relay_task = tokio::spawn(async move {
        let (client, _) = front.accept().await.unwrap();
        let origin = TcpStream::connect(origin_addr).await.unwrap();
        let client = Metered::new(client);
        let counters = client.counters();
        let stats = relay(client, origin, 512).await.unwrap();
        (stats, counters.snapshot())
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client.write_all(b"echo me").await.unwrap();
    client.shutdown().await.unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"echo me!");

    origin_task.await.unwrap();
    let (stats, metered) = relay_task.await.unwrap();
    assert_eq!(stats, metered);
    assert_eq!(stats.client_to_origin, 7);
    assert_eq!(stats.origin_to_client, 8);
}
