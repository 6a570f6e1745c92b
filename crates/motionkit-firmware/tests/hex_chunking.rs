//! Chunking depends on address contiguity, not on how data is split into
//! lines

use motionkit_firmware::{Chunk, HexRecord, HexRecordParser, HexRecordProcessor, RecordType};
use proptest::prelude::*;

/// Render `bytes` at `base` as hex text, with line lengths taken in turn
/// from `splits`
fn render(base: u16, bytes: &[u8], splits: &[usize]) -> String {
    let mut lines = Vec::new();
    let mut offset = 0usize;
    let mut split = splits.iter().cycle();
    while offset < bytes.len() {
        let len = (*split.next().unwrap_or(&16)).min(bytes.len() - offset);
        let address = base + offset as u16;
        lines.push(
            HexRecord::new(RecordType::Data, address, bytes[offset..offset + len].to_vec())
                .to_line(),
        );
        offset += len;
    }
    lines.push(HexRecord::new(RecordType::EndOfFile, 0, vec![]).to_line());
    lines.join("\r\n")
}

fn chunk_text(text: &str, chunk_size: usize) -> Vec<Chunk> {
    let parser = HexRecordParser::from_text(text, "prop.hex");
    HexRecordProcessor::process(parser, chunk_size)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn test_hex_file_on_disk_chunks_at_extended_address() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("app.hex");
    std::fs::write(
        &path,
        ":020000040800F2\n:0B0010006164647265737320676170A7\n:00000001FF\n",
    )
    .unwrap();

    let chunks = HexRecordProcessor::load(&path, 4).unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].address, 0x0800_0010);
    assert_eq!(chunks[1].address, 0x0800_0014);
    assert_eq!(chunks[2].data, b"gap".to_vec());
}

proptest! {
    #[test]
    fn line_splitting_does_not_change_chunks(
        bytes in prop::collection::vec(any::<u8>(), 1..400),
        splits_a in prop::collection::vec(1usize..=32, 1..8),
        splits_b in prop::collection::vec(1usize..=32, 1..8),
        chunk_size in 1usize..=64,
        base in 0u16..0x1000,
    ) {
        let a = chunk_text(&render(base, &bytes, &splits_a), chunk_size);
        let b = chunk_text(&render(base, &bytes, &splits_b), chunk_size);
        prop_assert_eq!(&a, &b);

        let joined: Vec<u8> = a.iter().flat_map(|c| c.data.iter().copied()).collect();
        prop_assert_eq!(joined, bytes);
        prop_assert!(a.iter().all(|c| !c.data.is_empty() && c.data.len() <= chunk_size));
    }

    #[test]
    fn corrupted_checksum_is_always_a_checksum_error(
        data in prop::collection::vec(any::<u8>(), 0..32),
        address in any::<u16>(),
        delta in 1u8..=255,
    ) {
        let mut record = HexRecord::new(RecordType::Data, address, data);
        record.checksum = record.checksum.wrapping_add(delta);
        let result = motionkit_firmware::parse_line(&record.to_line(), 1, "prop.hex");
        let is_checksum_error = matches!(result, Err(motionkit_firmware::HexError::Checksum { .. }));
        prop_assert!(is_checksum_error);
    }
}
