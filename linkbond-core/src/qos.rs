//! Wire payloads of the in-band QoS protocol.
//!
//! A QoS measurement is a flat list of `(packet_id: u64 LE, holding_time_ms:
//! u16 LE)` records; the count is implied by the payload length and capped by
//! `QOS_MAX_PACKET_SIZE`. A path-negotiation request carries a single i16
//! utility in network byte order.

use crate::constants::{QOS_MAX_PACKET_SIZE, QOS_RECORD_LEN};

/// Serialize QoS records, silently truncating at the payload cap.
pub fn encode_qos_records(records: &[(u64, u16)]) -> Vec<u8> {
    let max_records = QOS_MAX_PACKET_SIZE / QOS_RECORD_LEN;
    let mut out = Vec::with_capacity(records.len().min(max_records) * QOS_RECORD_LEN);
    for &(packet_id, holding_time) in records.iter().take(max_records) {
        out.extend_from_slice(&packet_id.to_le_bytes());
        out.extend_from_slice(&holding_time.to_le_bytes());
    }
    out
}

/// Parse QoS records, ignoring any trailing partial record.
pub fn decode_qos_records(payload: &[u8]) -> Vec<(u64, u16)> {
    payload
        .chunks_exact(QOS_RECORD_LEN)
        .take(QOS_MAX_PACKET_SIZE / QOS_RECORD_LEN)
        .map(|chunk| {
            let packet_id = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let holding_time = u16::from_le_bytes(chunk[8..10].try_into().unwrap());
            (packet_id, holding_time)
        })
        .collect()
}

/// Serialize a path-negotiation utility (network byte order).
pub fn encode_utility(utility: i16) -> [u8; 2] {
    utility.to_be_bytes()
}

/// Parse a path-negotiation utility.
pub fn decode_utility(payload: &[u8]) -> Option<i16> {
    Some(i16::from_be_bytes(payload.get(0..2)?.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_records_round_trip() {
        let records = vec![(0x0102030405060708u64, 17u16), (42, 0), (u64::MAX, u16::MAX)];
        let wire = encode_qos_records(&records);
        assert_eq!(wire.len(), 3 * QOS_RECORD_LEN);
        assert_eq!(decode_qos_records(&wire), records);
    }

    #[test]
    fn test_qos_records_little_endian() {
        let wire = encode_qos_records(&[(1, 2)]);
        assert_eq!(wire[0], 1);
        assert_eq!(wire[8], 2);
        assert_eq!(wire[9], 0);
    }

    #[test]
    fn test_qos_encode_caps_payload() {
        let records: Vec<(u64, u16)> = (0..500).map(|i| (i as u64, i as u16)).collect();
        let wire = encode_qos_records(&records);
        assert!(wire.len() <= QOS_MAX_PACKET_SIZE);
        assert_eq!(wire.len() % QOS_RECORD_LEN, 0);
    }

    #[test]
    fn test_qos_decode_ignores_partial_tail() {
        let mut wire = encode_qos_records(&[(9, 9)]);
        wire.extend_from_slice(&[1, 2, 3]);
        assert_eq!(decode_qos_records(&wire), vec![(9, 9)]);
    }

    #[test]
    fn test_utility_round_trip() {
        for utility in [i16::MIN, -1, 0, 1, i16::MAX] {
            assert_eq!(decode_utility(&encode_utility(utility)), Some(utility));
        }
        assert_eq!(decode_utility(&[0x01]), None);
    }

    #[test]
    fn test_utility_network_order() {
        assert_eq!(encode_utility(0x0102), [0x01, 0x02]);
    }
}
