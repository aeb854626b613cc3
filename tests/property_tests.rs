//! Property-based tests for the UDX engine
//!
//! Uses proptest to check the containers against simple models, the wire
//! codec against arbitrary input, and delivery under random loss.

use proptest::prelude::*;

// ============================================================================
// Sequence Arithmetic Properties
// ============================================================================

mod seq_properties {
    use super::*;
    use std::cmp::Ordering;
    use udx_core::seq::{seq_cmp, seq_diff, seq_le, seq_lt, seq_max};

    proptest! {
        /// Ordering is antisymmetric away from the half-range ambiguity
        #[test]
        fn seq_cmp_antisymmetric(a in any::<u32>(), b in any::<u32>()) {
            prop_assume!(a.wrapping_sub(b) != 0x8000_0000);
            prop_assert_eq!(seq_cmp(a, b), seq_cmp(b, a).reverse());
            prop_assert_eq!(seq_lt(a, b), seq_cmp(a, b) == Ordering::Less);
            prop_assert_eq!(seq_le(a, b), !seq_lt(b, a));
        }

        /// Advancing by less than half the space always moves forward
        #[test]
        fn seq_forward_across_wrap(a in any::<u32>(), step in 1u32..0x8000_0000) {
            let b = a.wrapping_add(step);
            prop_assert!(seq_lt(a, b));
            prop_assert_eq!(seq_diff(b, a), step as i32);
            prop_assert_eq!(seq_max(a, b), b);
        }
    }
}

// ============================================================================
// Container Model Properties
// ============================================================================

mod cirbuf_properties {
    use super::*;
    use std::collections::HashMap;
    use udx_core::cirbuf::Cirbuf;

    #[derive(Debug, Clone)]
    enum Op {
        Set(u32, u64),
        Remove(u32),
        Get(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        // Keys stay within a 256 wide window, as sequence windows do
        prop_oneof![
            (0u32..256, any::<u64>()).prop_map(|(k, v)| Op::Set(k, v)),
            (0u32..256).prop_map(Op::Remove),
            (0u32..256).prop_map(Op::Get),
        ]
    }

    proptest! {
        /// Cirbuf behaves like a map for keys inside one window
        #[test]
        fn cirbuf_matches_map(base in any::<u32>(), ops in prop::collection::vec(op(), 1..200)) {
            let mut buf = Cirbuf::new(16);
            let mut model = HashMap::new();

            for op in ops {
                match op {
                    Op::Set(k, v) => {
                        let seq = base.wrapping_add(k);
                        prop_assert_eq!(buf.set(seq, v), model.insert(seq, v));
                    }
                    Op::Remove(k) => {
                        let seq = base.wrapping_add(k);
                        prop_assert_eq!(buf.remove(seq), model.remove(&seq));
                    }
                    Op::Get(k) => {
                        let seq = base.wrapping_add(k);
                        prop_assert_eq!(buf.get(seq), model.get(&seq));
                        prop_assert_eq!(buf.contains(seq), model.contains_key(&seq));
                    }
                }
                prop_assert_eq!(buf.len(), model.len());
            }

            prop_assert!(buf.capacity() <= 512);
            let mut drained = buf.drain();
            drained.sort_unstable();
            let mut expected: Vec<_> = model.into_iter().collect();
            expected.sort_unstable();
            prop_assert_eq!(drained, expected);
            prop_assert!(buf.is_empty());
        }
    }
}

mod fifo_properties {
    use super::*;
    use std::collections::VecDeque;
    use udx_core::fifo::Fifo;

    #[derive(Debug, Clone)]
    enum Op {
        Push,
        Shift,
        ShiftUndo,
        Remove(usize, bool),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Push),
            2 => Just(Op::Shift),
            1 => Just(Op::ShiftUndo),
            1 => (any::<usize>(), any::<bool>()).prop_map(|(i, h)| Op::Remove(i, h)),
        ]
    }

    proptest! {
        /// Fifo keeps order through growth, undo and tombstones
        #[test]
        fn fifo_matches_deque(ops in prop::collection::vec(op(), 1..300)) {
            let mut fifo = Fifo::new(2);
            let mut model: VecDeque<(u32, usize)> = VecDeque::new();
            let mut next = 0u32;

            for op in ops {
                match op {
                    Op::Push => {
                        let pos = fifo.push(next);
                        model.push_back((next, pos));
                        next += 1;
                    }
                    Op::Shift => {
                        prop_assert_eq!(fifo.shift(), model.pop_front().map(|(v, _)| v));
                    }
                    Op::ShiftUndo => {
                        let head = fifo.shift();
                        prop_assert_eq!(head, model.front().map(|(v, _)| *v));
                        if head.is_some() {
                            fifo.undo();
                        }
                    }
                    Op::Remove(i, use_hint) => {
                        if model.is_empty() {
                            prop_assert!(!fifo.remove(next, 0));
                            continue;
                        }
                        let idx = i % model.len();
                        let (value, pos) = model[idx];
                        let hint = if use_hint { pos } else { pos.wrapping_add(1) };
                        prop_assert!(fifo.remove(value, hint));
                        model.remove(idx);
                    }
                }
                prop_assert_eq!(fifo.len(), model.len());
                prop_assert_eq!(fifo.peek(), model.front().map(|(v, _)| *v));
            }

            let queued: Vec<u32> = fifo.iter().collect();
            let expected: Vec<u32> = model.iter().map(|(v, _)| *v).collect();
            prop_assert_eq!(queued, expected);
        }
    }
}

// ============================================================================
// Wire Codec Properties
// ============================================================================

mod header_properties {
    use super::*;
    use udx_core::header::{HEADER_SIZE, MAGIC, VERSION, push_sack_range};
    use udx_core::{Header, HeaderFlags, PacketView};

    proptest! {
        /// Every field survives encoding
        #[test]
        fn header_roundtrip(
            flags in any::<u8>(),
            offset in any::<u8>(),
            remote_id in any::<u32>(),
            window in any::<u32>(),
            seq in any::<u32>(),
            ack in any::<u32>(),
        ) {
            let mut header = Header::new(HeaderFlags::from_bits(flags), remote_id, seq, ack);
            header.data_offset = offset;
            header.recv_window = window;

            let mut buf = header.to_bytes().to_vec();
            buf.extend_from_slice(&[0u8; 4]);
            prop_assert_eq!(buf.len(), HEADER_SIZE + 4);
            prop_assert_eq!(Header::decode(&buf).unwrap(), header);
        }

        /// Arbitrary datagrams never panic the parser
        #[test]
        fn parse_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..256)) {
            if let Ok(view) = PacketView::parse(&data) {
                prop_assert_eq!(data[0], MAGIC);
                prop_assert_eq!(data[1], VERSION);
                prop_assert!(view.payload.len() <= data.len() - HEADER_SIZE);
                prop_assert!(view.sack_ranges().count() * 8 <= view.sack_area.len());
            }
        }

        /// SACK lists written by the sender read back in order
        #[test]
        fn sack_list_roundtrip(
            ranges in prop::collection::vec((any::<u32>(), 1u32..64), 1..16),
            payload in prop::collection::vec(any::<u8>(), 1..64),
        ) {
            let mut list = Vec::new();
            let expected: Vec<(u32, u32)> = ranges
                .iter()
                .map(|&(start, len)| (start, start.wrapping_add(len)))
                .collect();
            for &(start, end) in &expected {
                push_sack_range(&mut list, start, end);
            }

            let mut header = Header::new(HeaderFlags::new().with(HeaderFlags::SACK), 1, 0, 0);
            header.data_offset = list.len() as u8;
            let mut packet = header.to_bytes().to_vec();
            packet.extend_from_slice(&list);
            packet.extend_from_slice(&payload);

            let view = PacketView::parse(&packet).unwrap();
            prop_assert_eq!(view.sack_ranges().collect::<Vec<_>>(), expected);
            prop_assert_eq!(view.payload, &payload[..]);
        }
    }
}

// ============================================================================
// Delivery Properties
// ============================================================================

mod delivery_properties {
    use super::*;
    use udx_core::UdxConfig;
    use udx_integration_tests::fixtures::{SimPair, Verdict};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Random loss delays delivery but never corrupts or reorders it
        #[test]
        fn transfer_survives_random_loss(
            seed in any::<u64>(),
            loss_percent in 0u64..20,
            len in 1usize..40_000,
        ) {
            let mut pair = SimPair::new(UdxConfig::default());
            let mut state = seed | 1;
            pair.net.set_filter(move |_| {
                // xorshift keeps the loss pattern reproducible per seed
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                if state % 100 < loss_percent {
                    Verdict::Drop
                } else {
                    Verdict::Deliver
                }
            });
            let (a, b) = pair.connect(1, 2);
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

            pair.a.udx.stream_write_end(a, &[&data]).unwrap();
            prop_assert!(pair.run_until(120_000, |p| p.b.ended(b) || p.a.closed(a)));
            if pair.b.ended(b) {
                prop_assert_eq!(pair.b.read_bytes(b), data);
            } else {
                // Only a run of max_transmits losses of one packet closes it
                prop_assert!(loss_percent > 0);
            }
        }
    }
}
