use resim_serde::{BitReader, BitWriter, Serde};

use crate::{error::ProtocolError, types::InputId};

/// One collected input frame. Equality is by input id.
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub id: InputId,
    pub buffer: Vec<u8>,
    pub bit_size: u32,
    /// Input id of the first frame in the run of identical frames this one
    /// belongs to (its own id when the frame differs from its predecessor).
    /// Drives the run-length collapse on the wire.
    pub similarity: InputId,
    /// Local receipt timestamp in milliseconds; meaningful on the receiving
    /// side only.
    pub received_timestamp: u32,
}

impl PartialEq for FrameInput {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Encode a window of consecutive input frames into a packed batch:
/// the first input id, then run-length groups `(count, size_in_bits, bits)`.
/// Frames sharing a similarity run collapse into a single group.
pub fn encode_input_batch(frames: &[FrameInput]) -> Vec<u8> {
    let mut writer = BitWriter::new();
    let Some(first) = frames.first() else {
        return writer.to_bytes();
    };
    first.id.ser(&mut writer);

    let mut index = 0;
    while index < frames.len() {
        let head = &frames[index];
        let mut count = 1usize;
        while index + count < frames.len()
            && count < u8::MAX as usize
            && frames[index + count].similarity == head.similarity
        {
            count += 1;
        }

        (count as u8).ser(&mut writer);
        (head.bit_size as u16).ser(&mut writer);
        writer.write_bits(&head.buffer, head.bit_size);

        index += count;
    }

    writer.to_bytes()
}

/// Decode a packed batch back into `(input_id, bits, bit_size)` triples,
/// expanding the run-length groups.
pub fn decode_input_batch(
    bytes: &[u8],
) -> Result<Vec<(InputId, Vec<u8>, u32)>, ProtocolError> {
    let mut reader = BitReader::new(bytes);
    let mut out = Vec::new();

    if reader.bits_remaining() < 32 {
        if bytes.is_empty() {
            return Ok(out);
        }
        return Err(ProtocolError::MalformedInputBatch(
            "batch too short for the leading input id",
        ));
    }
    let first_id = InputId::de(&mut reader)?;

    let mut next_id = first_id;
    // Anything shorter than a group header is byte padding.
    while reader.bits_remaining() >= 24 {
        let count = u8::de(&mut reader)?;
        if count == 0 {
            return Err(ProtocolError::MalformedInputBatch(
                "input group with a zero frame count",
            ));
        }
        let bit_size = u16::de(&mut reader)? as u32;
        if reader.bits_remaining() < bit_size as usize {
            return Err(ProtocolError::MalformedInputBatch(
                "input group declares more bits than the batch holds",
            ));
        }
        let buffer = reader.read_bits(bit_size)?;

        for _ in 0..count {
            out.push((next_id, buffer.clone(), bit_size));
            next_id = next_id.wrapping_add(1);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: InputId, similarity: InputId, bits: &[u8], bit_size: u32) -> FrameInput {
        FrameInput {
            id,
            buffer: bits.to_vec(),
            bit_size,
            similarity,
            received_timestamp: 0,
        }
    }

    #[test]
    fn batch_round_trips_distinct_frames() {
        let frames = vec![
            frame(10, 10, &[0b0000_0101], 3),
            frame(11, 11, &[0b0000_0110], 3),
            frame(12, 12, &[0b0000_0001], 3),
        ];
        let bytes = encode_input_batch(&frames);
        let decoded = decode_input_batch(&bytes).unwrap();

        assert_eq!(decoded.len(), 3);
        for (input, original) in decoded.iter().zip(frames.iter()) {
            assert_eq!(input.0, original.id);
            assert_eq!(input.2, original.bit_size);
            assert_eq!(input.1[0] & 0b111, original.buffer[0] & 0b111);
        }
    }

    #[test]
    fn identical_frames_collapse_and_reexpand() {
        let frames = vec![
            frame(5, 5, &[0b0000_1111], 4),
            frame(6, 5, &[0b0000_1111], 4),
            frame(7, 5, &[0b0000_1111], 4),
            frame(8, 8, &[0b0000_0000], 4),
        ];
        let bytes = encode_input_batch(&frames);
        let collapsed = encode_input_batch(&frames[..3]);
        // Three identical frames cost one group, not three.
        assert!(collapsed.len() < encode_input_batch(&frames[..1]).len() * 2);

        let decoded = decode_input_batch(&bytes).unwrap();
        assert_eq!(
            decoded.iter().map(|(id, _, _)| *id).collect::<Vec<_>>(),
            vec![5, 6, 7, 8]
        );
        assert_eq!(decoded[1].1, decoded[0].1);
        assert_ne!(decoded[3].1[0] & 0b1111, decoded[0].1[0] & 0b1111);
    }

    #[test]
    fn empty_input_frames_are_legal() {
        let frames = vec![frame(3, 3, &[], 0)];
        let decoded = decode_input_batch(&encode_input_batch(&frames)).unwrap();
        assert_eq!(decoded, vec![(3, Vec::new(), 0)]);
    }

    #[test]
    fn truncated_batches_fail_cleanly() {
        let frames = vec![frame(1, 1, &[0xFF, 0xFF], 16)];
        let mut bytes = encode_input_batch(&frames);
        bytes.truncate(5);
        assert!(decode_input_batch(&bytes).is_err());

        assert!(decode_input_batch(&[1, 2]).is_err());
        assert!(decode_input_batch(&[]).unwrap().is_empty());
    }
}
