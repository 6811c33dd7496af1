//! Chunked messages over a real UDP socket pair.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use trellis_core::{ChunkCodec, Decoded, MessageChunk};
use trellis_services::{aggregate, MessageSplitter, ReassemblyBuffer};

use crate::*;

fn reassembler() -> ReassemblyBuffer {
    ReassemblyBuffer::new(1024 * 1024, Duration::from_secs(60))
}

fn expect_chunk(codec: &ChunkCodec, bytes: Bytes) -> MessageChunk {
    match codec.decode(bytes) {
        Decoded::Chunk(c) => c,
        Decoded::Passthrough(b) => panic!("expected a chunk, got {} raw bytes", b.len()),
    }
}

#[tokio::test]
async fn three_chunk_message_arriving_last_first() {
    let codec = ChunkCodec::new(2).unwrap();
    let tx = loopback_udp().await.unwrap();
    let rx = loopback_udp().await.unwrap();
    let dest = rx.local_addr().unwrap();

    let chunk0 = MessageChunk::content(5, 0, Bytes::from_static(b"AB"));
    let chunk1 = MessageChunk::content(5, 1, Bytes::from_static(b"CD"));
    let last = MessageChunk::last(5, 2, Bytes::new());

    for chunk in [&last, &chunk0, &chunk1] {
        tx.send_to(&codec.encode(chunk).unwrap(), dest).await.unwrap();
    }

    let mut buffer = reassembler();
    let mut emitted = Vec::new();
    for (_, datagram) in recv_datagrams(&rx, 3).await.unwrap() {
        let out = buffer.on_chunk(expect_chunk(&codec, datagram)).unwrap();
        if !out.is_empty() {
            emitted = out;
        }
    }
    assert_eq!(emitted, vec![chunk0, chunk1, last]);
    assert_eq!(aggregate(emitted), Bytes::from_static(b"ABCD"));
}

#[tokio::test]
async fn large_message_reassembles_in_reverse_order() {
    let splitter = MessageSplitter::new(ChunkCodec::new(1).unwrap(), 512, 1024 * 1024).unwrap();
    let tx = loopback_udp().await.unwrap();
    let rx = loopback_udp().await.unwrap();
    let dest = rx.local_addr().unwrap();

    let content = payload(60_000);
    let mut datagrams = splitter.split_encoded(content.clone()).unwrap();
    assert!(datagrams.len() > 100);
    datagrams.reverse();
    let n = datagrams.len();
    for d in datagrams {
        assert!(d.len() <= 512);
        tx.send_to(&d, dest).await.unwrap();
    }

    let mut buffer = reassembler();
    let mut done = None;
    for (_, datagram) in recv_datagrams(&rx, n).await.unwrap() {
        let out = buffer.on_chunk(expect_chunk(&splitter.codec(), datagram)).unwrap();
        if !out.is_empty() {
            assert!(done.is_none(), "message emitted twice");
            done = Some(aggregate(out));
        }
    }
    assert_eq!(done, Some(content));
    assert!(buffer.is_idle());
}

#[tokio::test]
async fn interleaved_senders_reassemble_independently() {
    let codec = ChunkCodec::new(2).unwrap();
    let a = loopback_udp().await.unwrap();
    let b = loopback_udp().await.unwrap();
    let rx = loopback_udp().await.unwrap();
    let dest = rx.local_addr().unwrap();

    // same message id from both senders
    let split = |body: &'static [u8]| {
        vec![
            MessageChunk::content(1, 0, Bytes::from_static(&body[..2])),
            MessageChunk::content(1, 1, Bytes::from_static(&body[2..4])),
            MessageChunk::last(1, 2, Bytes::from_static(&body[4..])),
        ]
    };
    let from_a = split(b"aaaaAA");
    let from_b = split(b"bbbbBB");
    for i in 0..3 {
        a.send_to(&codec.encode(&from_a[i]).unwrap(), dest).await.unwrap();
        b.send_to(&codec.encode(&from_b[2 - i]).unwrap(), dest).await.unwrap();
    }

    let mut buffers: HashMap<_, ReassemblyBuffer> = HashMap::new();
    let mut messages = HashMap::new();
    for (from, datagram) in recv_datagrams(&rx, 6).await.unwrap() {
        let buffer = buffers.entry(from).or_insert_with(reassembler);
        let out = buffer.on_chunk(expect_chunk(&codec, datagram)).unwrap();
        if !out.is_empty() {
            messages.insert(from, aggregate(out));
        }
    }
    assert_eq!(messages[&a.local_addr().unwrap()], Bytes::from_static(b"aaaaAA"));
    assert_eq!(messages[&b.local_addr().unwrap()], Bytes::from_static(b"bbbbBB"));
}

#[tokio::test]
async fn unchunked_traffic_passes_through_the_decoder() {
    let codec = ChunkCodec::new(3).unwrap();
    let tx = loopback_udp().await.unwrap();
    let rx = loopback_udp().await.unwrap();
    tx.send_to(b"plain datagram", rx.local_addr().unwrap()).await.unwrap();

    let (_, datagram) = recv_datagrams(&rx, 1).await.unwrap().remove(0);
    assert_eq!(
        codec.decode(datagram),
        Decoded::Passthrough(Bytes::from_static(b"plain datagram"))
    );
}

#[tokio::test]
async fn incomplete_message_times_out_and_next_one_completes() {
    let codec = ChunkCodec::new(2).unwrap();
    let tx = loopback_udp().await.unwrap();
    let rx = loopback_udp().await.unwrap();
    let dest = rx.local_addr().unwrap();

    let mut buffer = ReassemblyBuffer::new(1024, Duration::from_millis(50));
    tx.send_to(&codec.encode(&MessageChunk::content(1, 0, Bytes::from_static(b"x"))).unwrap(), dest)
        .await
        .unwrap();
    let (_, d) = recv_datagrams(&rx, 1).await.unwrap().remove(0);
    assert!(buffer.on_chunk(expect_chunk(&codec, d)).unwrap().is_empty());

    let ticket = buffer.pending_timeout().unwrap();
    tokio::time::sleep_until(ticket.deadline()).await;
    assert!(buffer.on_timeout(ticket));
    assert!(buffer.is_idle());

    tx.send_to(&codec.encode(&MessageChunk::last(2, 0, Bytes::from_static(b"y"))).unwrap(), dest)
        .await
        .unwrap();
    let (_, d) = recv_datagrams(&rx, 1).await.unwrap().remove(0);
    let out = buffer.on_chunk(expect_chunk(&codec, d)).unwrap();
    assert_eq!(aggregate(out), Bytes::from_static(b"y"));
}
