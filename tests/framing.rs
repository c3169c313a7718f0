use multiproc_metrics::{Frame, LabelSet, MetricEvent, decode};
use proptest::prelude::*;

fn event_strategy() -> impl Strategy<Value = MetricEvent> {
    let register = ("[a-z_][a-z0-9_]{0,15}", proptest::option::of("[^\r\n]{1,30}")).prop_map(
        |(name, description)| MetricEvent::Register {
            kind: "counter".into(),
            name,
            description,
        },
    );
    let increment = (
        "[a-z_][a-z0-9_]{0,15}",
        0.0f64..1e9,
        proptest::collection::btree_map("[a-z_]{1,8}", any::<String>(), 0..4),
    )
        .prop_map(|(name, amount, labels)| MetricEvent::Increment {
            name,
            amount: amount.to_string(),
            labels: labels.into_iter().collect::<LabelSet>().to_string(),
        });
    prop_oneof![register, increment]
}

/// Feeds `bytes` to the decoder in `chunk`-sized pieces, the way a socket might deliver them.
fn decode_in_pieces(bytes: &[u8], chunk: usize) -> Vec<Frame> {
    let mut buf = Vec::new();
    let mut frames = Vec::new();
    for piece in bytes.chunks(chunk) {
        buf.extend_from_slice(piece);
        while let Some((frame, used)) = decode(&buf).unwrap() {
            frames.push(frame);
            buf.drain(..used);
        }
    }
    assert!(buf.is_empty());
    frames
}

proptest! {
    #[test]
    fn byte_at_a_time_matches_all_at_once(
        events in proptest::collection::vec(event_strategy(), 1..8),
    ) {
        let bytes: Vec<u8> = events.iter().flat_map(MetricEvent::encode).collect();
        let expected: Vec<Frame> = events.into_iter().map(Frame::Event).collect();

        prop_assert_eq!(&decode_in_pieces(&bytes, bytes.len()), &expected);
        prop_assert_eq!(&decode_in_pieces(&bytes, 1), &expected);
    }

    #[test]
    fn arbitrary_split_points_decode_identically(
        events in proptest::collection::vec(event_strategy(), 1..8),
        chunk in 1usize..64,
    ) {
        let bytes: Vec<u8> = events.iter().flat_map(MetricEvent::encode).collect();
        let expected: Vec<Frame> = events.into_iter().map(Frame::Event).collect();
        prop_assert_eq!(decode_in_pieces(&bytes, chunk), expected);
    }
}

#[test]
fn queries_interleave_with_frames() {
    let event = MetricEvent::Increment {
        name: "hits".into(),
        amount: "1".into(),
        labels: String::new(),
    };
    let mut bytes = b"?".to_vec();
    bytes.extend(event.encode());
    bytes.push(b'?');

    assert_eq!(
        decode_in_pieces(&bytes, 1),
        vec![Frame::Query, Frame::Event(event), Frame::Query]
    );
}
