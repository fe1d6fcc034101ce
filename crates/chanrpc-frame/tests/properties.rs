//! Partition-invariance properties for the chunk aggregator and decoders.

use bytes::{Bytes, BytesMut};
use chanrpc_frame::{encode_frame, encode_packet, Buffers, FrameDecoder, StreamPacketDecoder};
use proptest::prelude::*;

/// Split `data` into chunks whose sizes cycle through `sizes`.
fn partition(data: &[u8], sizes: &[usize]) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    let mut index = 0;
    while offset < data.len() {
        let size = sizes[index % sizes.len()].min(data.len() - offset);
        chunks.push(Bytes::copy_from_slice(&data[offset..offset + size]));
        offset += size;
        index += 1;
    }
    chunks
}

fn data_and_sizes() -> impl Strategy<Value = (Vec<u8>, Vec<usize>)> {
    (
        proptest::collection::vec(any::<u8>(), 0..256),
        proptest::collection::vec(1usize..24, 1..8),
    )
}

proptest! {
    #[test]
    fn slice_matches_flat_buffer(
        (data, sizes) in data_and_sizes(),
        a in any::<prop::sample::Index>(),
        b in any::<prop::sample::Index>(),
    ) {
        let buffers: Buffers = partition(&data, &sizes).into_iter().collect();
        prop_assert_eq!(buffers.len(), data.len());

        let (mut start, mut end) = (a.index(data.len() + 1), b.index(data.len() + 1));
        if start > end {
            std::mem::swap(&mut start, &mut end);
        }
        let sliced = buffers.slice(start, end).unwrap();
        prop_assert_eq!(sliced.as_ref(), &data[start..end]);
    }

    #[test]
    fn splice_matches_vec_splice(
        (data, sizes) in data_and_sizes(),
        start in any::<prop::sample::Index>(),
        delete_count in 0usize..64,
        replacement in proptest::collection::vec(any::<u8>(), 0..48),
        replacement_sizes in proptest::collection::vec(1usize..8, 1..4),
    ) {
        let mut buffers: Buffers = partition(&data, &sizes).into_iter().collect();
        let start = start.index(data.len() + 1);

        let mut expected = data.clone();
        let end = (start + delete_count).min(expected.len());
        let expected_removed: Vec<u8> = expected
            .splice(start..end, replacement.iter().copied())
            .collect();

        let removed = buffers
            .splice(start, delete_count, partition(&replacement, &replacement_sizes))
            .unwrap();

        let removed_bytes = removed.to_bytes();
        prop_assert_eq!(removed_bytes.as_ref(), expected_removed.as_slice());
        let buffers_bytes = buffers.to_bytes();
        prop_assert_eq!(buffers_bytes.as_ref(), expected.as_slice());
        prop_assert_eq!(buffers.len(), expected.len());
        let chunk_total: usize = buffers.chunks().map(|chunk| chunk.len()).sum();
        prop_assert_eq!(chunk_total, buffers.len());
    }

    #[test]
    fn cursor_iteration_matches_flat_buffer(
        (data, sizes) in data_and_sizes(),
        offset in any::<prop::sample::Index>(),
    ) {
        let buffers: Buffers = partition(&data, &sizes).into_iter().collect();
        let offset = offset.index(data.len() + 1);
        let collected: Vec<u8> = buffers.cursor(offset).unwrap().collect();
        prop_assert_eq!(collected.as_slice(), &data[offset..]);
    }

    #[test]
    fn frame_decoder_reassembles_any_split(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..128), 1..6),
        sizes in proptest::collection::vec(1usize..32, 1..8),
    ) {
        let mut wire = BytesMut::new();
        for payload in &payloads {
            encode_frame(payload, &mut wire).unwrap();
        }

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in partition(&wire, &sizes) {
            decoder.push(chunk, |frame| frames.push(frame.to_vec())).unwrap();
        }
        prop_assert_eq!(frames, payloads);
        prop_assert!(decoder.is_idle());
    }

    #[test]
    fn packet_decoder_reassembles_any_split(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 1..4),
        sizes in proptest::collection::vec(1usize..32, 1..8),
    ) {
        let mut wire = BytesMut::new();
        for payload in &payloads {
            encode_packet(payload, &mut wire).unwrap();
        }

        let mut decoder = StreamPacketDecoder::new();
        let mut packets = Vec::new();
        for chunk in partition(&wire, &sizes) {
            decoder.push(chunk, |packet| packets.push(packet.to_vec())).unwrap();
        }
        prop_assert_eq!(packets, payloads);
        prop_assert_eq!(decoder.buffered(), 0);
    }
}
