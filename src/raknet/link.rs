use super::{
    fragment, id, next_u24, AckRecord, Datagram, DatagramFlags, Frame, RakNetError, Reliability,
    SplitAssembler, SplitInfo, HEADER_MARGIN,
};
use ahash::AHashSet;
use bytes::Bytes;
use std::collections::VecDeque;

/// Sent datagrams kept for NACK-driven resends.
const RESEND_WINDOW: usize = 512;
/// Reliable message indexes remembered to drop resent duplicates.
const DEDUP_WINDOW: usize = 1024;

/// Output of [`ReliableLink::receive`].
#[derive(Debug, Default)]
pub struct Received {
    /// Datagrams to send back to the peer: acknowledgements and resends.
    pub replies: Vec<Vec<u8>>,
    /// Complete (reassembled) message payloads, in arrival order.
    pub payloads: Vec<Bytes>,
}

/// Reliable framing state of one connected peer.
///
/// Outbound messages are framed reliable-ordered on channel 0 and split
/// when larger than `mtu - HEADER_MARGIN`. Every inbound frame set is
/// acknowledged individually.
#[derive(Debug)]
pub struct ReliableLink {
    mtu: u16,
    send_sequence: u32,
    message_index: u32,
    order_index: u32,
    split_id: u16,
    expected_sequence: u32,
    assembler: SplitAssembler,
    sent: VecDeque<(u32, Vec<u8>)>,
    seen_messages: AHashSet<u32>,
    seen_order: VecDeque<u32>,
}

impl ReliableLink {
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu,
            send_sequence: 0,
            message_index: 0,
            order_index: 0,
            split_id: 0,
            expected_sequence: 0,
            assembler: SplitAssembler::new(),
            sent: VecDeque::new(),
            seen_messages: AHashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    fn max_frame_payload(&self) -> usize {
        usize::from(self.mtu).saturating_sub(HEADER_MARGIN).max(1)
    }

    /// Frames a message, returning the datagrams to send.
    pub fn wrap(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let order = (next_u24(&mut self.order_index), 0);
        let max = self.max_frame_payload();

        let frames = if payload.len() <= max {
            vec![self.frame(order, None, Bytes::copy_from_slice(payload))]
        } else {
            let chunks = fragment(payload, max);
            let count = chunks.len().try_into().unwrap_or(u32::MAX);
            let split_id = self.split_id;
            self.split_id = self.split_id.wrapping_add(1);
            chunks
                .into_iter()
                .zip(0u32..)
                .map(|(chunk, index)| {
                    let split = SplitInfo {
                        count,
                        id: split_id,
                        index,
                    };
                    self.frame(order, Some(split), chunk)
                })
                .collect()
        };

        frames
            .into_iter()
            .map(|frame| {
                let sequence = next_u24(&mut self.send_sequence);
                let bytes = Datagram {
                    sequence,
                    frames: vec![frame],
                }
                .encode();
                self.remember(sequence, &bytes);
                bytes
            })
            .collect()
    }

    fn frame(&mut self, order: (u32, u8), split: Option<SplitInfo>, payload: Bytes) -> Frame {
        Frame {
            reliability: Reliability::ReliableOrdered,
            message_index: Some(next_u24(&mut self.message_index)),
            sequence_index: None,
            order: Some(order),
            split,
            payload,
        }
    }

    fn remember(&mut self, sequence: u32, datagram: &[u8]) {
        if self.sent.len() >= RESEND_WINDOW {
            self.sent.pop_front();
        }
        self.sent.push_back((sequence, datagram.to_vec()));
    }

    /// Processes an online datagram (frame set, ACK or NACK).
    pub fn receive(&mut self, datagram: &[u8]) -> Result<Received, RakNetError> {
        let mut received = Received::default();
        let Some(&first) = datagram.first() else {
            return Ok(received);
        };
        let flags = DatagramFlags::from_bits_truncate(first);

        if flags.contains(DatagramFlags::ACK) {
            let records = AckRecord::decode_all(datagram)?;
            self.sent
                .retain(|(sequence, _)| !records.iter().any(|r| r.contains(*sequence)));
            return Ok(received);
        }
        if flags.contains(DatagramFlags::NACK) {
            let records = AckRecord::decode_all(datagram)?;
            received.replies = self
                .sent
                .iter()
                .filter(|(sequence, _)| records.iter().any(|r| r.contains(*sequence)))
                .map(|(_, bytes)| bytes.clone())
                .collect();
            return Ok(received);
        }

        let datagram = Datagram::decode(datagram)?;
        received
            .replies
            .push(AckRecord::encode_all(id::ACK, &[AckRecord::single(datagram.sequence)]));
        if let Some(nack) = self.missing_before(datagram.sequence) {
            received.replies.push(nack);
        }

        for frame in datagram.frames {
            if frame.message_index.is_some_and(|index| self.seen_messages.contains(&index)) {
                continue;
            }
            let payload = match frame.split {
                Some(split) => match self.assembler.insert(split, frame.payload) {
                    Ok(Some(whole)) => Some(whole),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!("Dropping frame of datagram {}: {e}", datagram.sequence);
                        continue;
                    }
                },
                None => Some(frame.payload),
            };
            if let Some(index) = frame.message_index {
                self.mark_delivered(index);
            }
            received.payloads.extend(payload);
        }
        Ok(received)
    }

    /// Tracks the expected next sequence number, returning a NACK for any
    /// gap skipped by `sequence`.
    fn missing_before(&mut self, sequence: u32) -> Option<Vec<u8>> {
        let expected = self.expected_sequence;
        let gap = sequence.wrapping_sub(expected) & 0x00ff_ffff;
        if gap >= 0x0080_0000 {
            // Late or resent datagram.
            return None;
        }
        self.expected_sequence = (sequence + 1) & 0x00ff_ffff;
        if gap == 0 {
            return None;
        }
        let last = sequence.wrapping_sub(1) & 0x00ff_ffff;
        let record = AckRecord {
            first: expected,
            last,
        };
        Some(AckRecord::encode_all(id::NACK, &[record]))
    }

    fn mark_delivered(&mut self, message_index: u32) {
        if !self.seen_messages.insert(message_index) {
            return;
        }
        self.seen_order.push_back(message_index);
        if self.seen_order.len() > DEDUP_WINDOW {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen_messages.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raknet::UDP_OVERHEAD;

    #[test]
    fn small_payload_is_one_datagram() {
        let mut sender = ReliableLink::new(1400);
        let mut receiver = ReliableLink::new(1400);
        let datagrams = sender.wrap(b"\xfehello");
        assert_eq!(datagrams.len(), 1);
        let received = receiver.receive(&datagrams[0]).unwrap();
        assert_eq!(received.payloads, [Bytes::from_static(b"\xfehello")]);
        assert_eq!(received.replies, [vec![0xC0, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00]]);
    }

    #[test]
    fn large_payload_is_split_and_reassembled_out_of_order() {
        let mut sender = ReliableLink::new(576);
        let mut receiver = ReliableLink::new(576);
        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let mut datagrams = sender.wrap(&payload);
        assert_eq!(datagrams.len(), 5000usize.div_ceil(576 - HEADER_MARGIN));
        for datagram in &datagrams {
            assert!(datagram.len() <= 576 - UDP_OVERHEAD);
        }
        datagrams.reverse();

        let mut payloads = Vec::new();
        for datagram in &datagrams {
            payloads.extend(receiver.receive(datagram).unwrap().payloads);
        }
        assert_eq!(payloads, [Bytes::from(payload)]);
    }

    #[test]
    fn payload_of_more_than_128_parts_is_reassembled() {
        let mut sender = ReliableLink::new(1400);
        let mut receiver = ReliableLink::new(1400);
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
        let datagrams = sender.wrap(&payload);
        assert!(datagrams.len() > 128);

        let mut payloads = Vec::new();
        for datagram in &datagrams {
            let received = receiver.receive(datagram).unwrap();
            assert_eq!(received.replies.len(), 1);
            payloads.extend(received.payloads);
        }
        assert_eq!(payloads, [Bytes::from(payload)]);
    }

    #[test]
    fn rejected_split_frame_keeps_the_ack_and_can_be_resent() {
        let mut receiver = ReliableLink::new(1400);
        let frame = |count, index, payload: &'static [u8]| Frame {
            reliability: Reliability::ReliableOrdered,
            message_index: Some(index),
            sequence_index: None,
            order: Some((0, 0)),
            split: Some(SplitInfo { count, id: 3, index }),
            payload: Bytes::from_static(payload),
        };
        let bad = Datagram {
            sequence: 0,
            frames: vec![frame(0, 0, b"ab")],
        };
        let received = receiver.receive(&bad.encode()).unwrap();
        assert!(received.payloads.is_empty());
        assert_eq!(received.replies.len(), 1);
        assert_eq!(received.replies[0][0], id::ACK);

        // Message index 0 was not consumed by the rejected frame.
        let good = Datagram {
            sequence: 1,
            frames: vec![frame(2, 0, b"ab"), frame(2, 1, b"cd")],
        };
        let received = receiver.receive(&good.encode()).unwrap();
        assert_eq!(received.payloads, [Bytes::from_static(b"abcd")]);
    }

    #[test]
    fn ack_clears_and_nack_resends() {
        let mut sender = ReliableLink::new(1400);
        let _first = sender.wrap(b"a").remove(0);
        let second = sender.wrap(b"b").remove(0);

        let nack = AckRecord::encode_all(id::NACK, &[AckRecord::single(1)]);
        assert_eq!(sender.receive(&nack).unwrap().replies, [second]);

        let ack = AckRecord::encode_all(id::ACK, &[AckRecord { first: 0, last: 1 }]);
        sender.receive(&ack).unwrap();
        let nack = AckRecord::encode_all(id::NACK, &[AckRecord::single(0)]);
        assert!(sender.receive(&nack).unwrap().replies.is_empty());
    }

    #[test]
    fn resent_datagram_is_delivered_once() {
        let mut sender = ReliableLink::new(1400);
        let mut receiver = ReliableLink::new(1400);
        let datagram = sender.wrap(b"once").remove(0);
        assert_eq!(receiver.receive(&datagram).unwrap().payloads.len(), 1);
        assert!(receiver.receive(&datagram).unwrap().payloads.is_empty());
    }

    #[test]
    fn gap_produces_nack() {
        let mut sender = ReliableLink::new(1400);
        let mut receiver = ReliableLink::new(1400);
        let _lost = sender.wrap(b"a");
        let datagram = sender.wrap(b"b").remove(0);
        let replies = receiver.receive(&datagram).unwrap().replies;
        assert_eq!(replies.len(), 2);
        assert_eq!(AckRecord::decode_all(&replies[1]).unwrap(), [AckRecord::single(0)]);
        assert_eq!(replies[1][0], id::NACK);
    }
}
