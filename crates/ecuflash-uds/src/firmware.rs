//! Motorola S-record firmware images
//!
//! An image is split into [`MemoryBlock`]s: maximal runs of data records
//! whose addresses follow on from each other without a gap. Blocks keep
//! the order in which they first appear in the file.

use std::fmt;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::error::FlashError;

/// A contiguous region of memory to download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlock {
    pub address: u32,
    pub payload: Vec<u8>,
}

impl MemoryBlock {
    pub fn new(address: u32, payload: Vec<u8>) -> Self {
        Self { address, payload }
    }

    /// Number of payload bytes; always equal to `payload.len()`
    pub fn size(&self) -> u32 {
        self.payload.len() as u32
    }

    /// One past the last address covered by this block
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.payload.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Display for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}+0x{:X}", self.address, self.payload.len())
    }
}

/// Malformed firmware image, with the 1-based line number at fault
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("record does not start with 'S'")]
    MissingStartCode,

    #[error("unsupported record type '{0}'")]
    UnsupportedType(char),

    #[error("invalid hex digits")]
    InvalidHex,

    #[error("record too short")]
    TooShort,

    #[error("byte count 0x{declared:02X} does not match the {actual} bytes present")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch: record has 0x{found:02X}, computed 0x{computed:02X}")]
    Checksum { found: u8, computed: u8 },

    #[error("S0 header is only allowed as the first record")]
    MisplacedHeader,

    #[error("termination record is only allowed as the last record")]
    MisplacedTermination,

    #[error("data runs past the end of the 32-bit address space")]
    AddressOverflow,

    #[error("block at 0x{address:08X} overlaps the block starting on line {other_line}")]
    Overlap { address: u32, other_line: usize },
}

impl ParseErrorKind {
    fn at(self, line: usize) -> ParseError {
        ParseError { line, kind: self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Header,
    Data { address_width: usize },
    Count,
    Termination,
}

#[derive(Debug)]
struct Record {
    kind: RecordKind,
    address: u32,
    data: Vec<u8>,
}

fn parse_record(text: &str, line: usize) -> Result<Record, ParseError> {
    let mut chars = text.chars();
    if chars.next() != Some('S') {
        return Err(ParseErrorKind::MissingStartCode.at(line));
    }
    let type_char = chars.next().ok_or(ParseErrorKind::TooShort.at(line))?;
    let kind = match type_char {
        '0' => RecordKind::Header,
        '1' => RecordKind::Data { address_width: 2 },
        '2' => RecordKind::Data { address_width: 3 },
        '3' => RecordKind::Data { address_width: 4 },
        '5' | '6' => RecordKind::Count,
        '7' | '8' | '9' => RecordKind::Termination,
        other => return Err(ParseErrorKind::UnsupportedType(other).at(line)),
    };

    let bytes = hex::decode(&text[2..]).map_err(|_| ParseErrorKind::InvalidHex.at(line))?;

    // count byte, then address, data and checksum
    let Some((&count, rest)) = bytes.split_first() else {
        return Err(ParseErrorKind::TooShort.at(line));
    };
    if usize::from(count) != rest.len() {
        return Err(ParseErrorKind::LengthMismatch {
            declared: usize::from(count),
            actual: rest.len(),
        }
        .at(line));
    }

    let address_width = match (type_char, kind) {
        (_, RecordKind::Data { address_width }) => address_width,
        ('0' | '5' | '9', _) => 2,
        ('6' | '8', _) => 3,
        _ => 4,
    };
    if rest.len() < address_width + 1 {
        return Err(ParseErrorKind::TooShort.at(line));
    }

    let sum = bytes[..bytes.len() - 1]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    let computed = !sum;
    let found = bytes[bytes.len() - 1];
    if computed != found {
        return Err(ParseErrorKind::Checksum { found, computed }.at(line));
    }

    let address = rest[..address_width]
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
    let data = rest[address_width..rest.len() - 1].to_vec();

    Ok(Record {
        kind,
        address,
        data,
    })
}

/// Split an S-record image into contiguous memory blocks
///
/// A record continues the current block when its address equals the
/// previous record's address plus that record's data length. The S0 header
/// and the S7/S8/S9 termination record frame the image and carry no block
/// data; S5/S6 count records are skipped. Blank lines are ignored.
pub fn segment(text: &str) -> Result<Vec<MemoryBlock>, ParseError> {
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty())
        .collect();

    // (first line of the block, block)
    let mut blocks: Vec<(usize, MemoryBlock)> = Vec::new();
    let mut next_address: Option<u64> = None;

    for (index, &(line, text)) in lines.iter().enumerate() {
        let record = parse_record(text, line)?;
        let is_first = index == 0;
        let is_last = index + 1 == lines.len();

        match record.kind {
            RecordKind::Header if !is_first => {
                return Err(ParseErrorKind::MisplacedHeader.at(line))
            }
            RecordKind::Termination if !is_last => {
                return Err(ParseErrorKind::MisplacedTermination.at(line))
            }
            RecordKind::Header | RecordKind::Termination | RecordKind::Count => continue,
            RecordKind::Data { .. } => {}
        }

        let end = u64::from(record.address) + record.data.len() as u64;
        if end > u64::from(u32::MAX) + 1 {
            return Err(ParseErrorKind::AddressOverflow.at(line));
        }

        match blocks.last_mut() {
            Some((_, block)) if next_address == Some(u64::from(record.address)) => {
                block.payload.extend_from_slice(&record.data);
            }
            _ => blocks.push((line, MemoryBlock::new(record.address, record.data))),
        }
        next_address = Some(end);
    }

    check_overlaps(&blocks)?;

    debug!(blocks = blocks.len(), "Segmented firmware image");
    Ok(blocks.into_iter().map(|(_, block)| block).collect())
}

fn check_overlaps(blocks: &[(usize, MemoryBlock)]) -> Result<(), ParseError> {
    let mut by_address: Vec<&(usize, MemoryBlock)> =
        blocks.iter().filter(|(_, b)| !b.is_empty()).collect();
    by_address.sort_by_key(|(_, b)| b.address);

    for pair in by_address.windows(2) {
        let (earlier_line, earlier) = pair[0];
        let (later_line, later) = pair[1];
        if u64::from(later.address) < earlier.end() {
            // Report against whichever block appears later in the file
            let (line, address, other_line) = if later_line > earlier_line {
                (*later_line, later.address, *earlier_line)
            } else {
                (*earlier_line, earlier.address, *later_line)
            };
            return Err(ParseErrorKind::Overlap {
                address,
                other_line,
            }
            .at(line));
        }
    }
    Ok(())
}

/// A parsed firmware image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    blocks: Vec<MemoryBlock>,
}

impl FirmwareImage {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        Ok(Self {
            blocks: segment(text)?,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlashError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| FlashError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text)?)
    }

    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<MemoryBlock> {
        self.blocks
    }

    /// Total payload bytes over all blocks
    pub fn total_size(&self) -> u64 {
        self.blocks.iter().map(|b| b.payload.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(kind: char, address: u32, data: &[u8]) -> String {
        let width = match kind {
            '0' | '1' | '5' | '9' => 2,
            '2' | '6' | '8' => 3,
            _ => 4,
        };
        let mut bytes = vec![(width + data.len() + 1) as u8];
        bytes.extend_from_slice(&address.to_be_bytes()[4 - width..]);
        bytes.extend_from_slice(data);
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes.push(!sum);
        format!("S{}{}", kind, hex::encode_upper(bytes))
    }

    fn image(records: &[String]) -> String {
        let mut lines = vec![record('0', 0, b"HDR")];
        lines.extend_from_slice(records);
        lines.push(record('8', 0, &[]));
        lines.join("\n")
    }

    #[test]
    fn test_contiguous_records_form_one_block() {
        let text = image(&[
            record('2', 0x010000, &[0x01; 16]),
            record('2', 0x010010, &[0x02; 16]),
            record('2', 0x010020, &[0x03; 5]),
        ]);

        let blocks = segment(&text).unwrap();

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].address, 0x010000);
        assert_eq!(blocks[0].size(), 37);
        assert_eq!(&blocks[0].payload[..16], &[0x01; 16]);
        assert_eq!(&blocks[0].payload[32..], &[0x03; 5]);
    }

    #[test]
    fn test_gap_splits_blocks_at_boundary() {
        let text = image(&[
            record('2', 0x1000, &[0xAA; 8]),
            record('2', 0x1008, &[0xBB; 8]),
            record('2', 0x2000, &[0xCC; 4]),
            record('2', 0x2004, &[0xDD; 4]),
        ]);

        let blocks = segment(&text).unwrap();

        assert_eq!(
            blocks,
            vec![
                MemoryBlock::new(0x1000, [[0xAA; 8], [0xBB; 8]].concat()),
                MemoryBlock::new(0x2000, [[0xCC; 4], [0xDD; 4]].concat()),
            ]
        );
    }

    #[test]
    fn test_blocks_keep_file_order() {
        let text = image(&[
            record('2', 0x8000, &[1, 2]),
            record('2', 0x1000, &[3, 4]),
        ]);

        let blocks = segment(&text).unwrap();

        assert_eq!(blocks[0].address, 0x8000);
        assert_eq!(blocks[1].address, 0x1000);
    }

    #[test]
    fn test_single_line_image() {
        let blocks = segment(&record('2', 0x4000, &[9, 8, 7])).unwrap();
        assert_eq!(blocks, vec![MemoryBlock::new(0x4000, vec![9, 8, 7])]);
    }

    #[test]
    fn test_framing_records_produce_no_blocks() {
        let text = image(&[]);
        assert!(segment(&text).unwrap().is_empty());
    }

    #[test]
    fn test_s1_s3_and_count_records() {
        let text = [
            record('1', 0x0100, &[1, 2]),
            record('1', 0x0102, &[3]),
            record('3', 0x8000_0000, &[4, 5, 6]),
            record('5', 3, &[]),
            record('7', 0, &[]),
        ]
        .join("\n");

        let blocks = segment(&text).unwrap();

        assert_eq!(
            blocks,
            vec![
                MemoryBlock::new(0x0100, vec![1, 2, 3]),
                MemoryBlock::new(0x8000_0000, vec![4, 5, 6]),
            ]
        );
    }

    #[test]
    fn test_invalid_hex_names_line() {
        let text = format!("{}\nS2080010ZZ00000000FF\n", record('2', 0x10, &[0]));

        let err = segment(&text).unwrap_err();

        assert_eq!(err.line, 2);
        assert_eq!(err.kind, ParseErrorKind::InvalidHex);
    }

    #[test]
    fn test_bad_checksum() {
        let mut bad = record('2', 0x10, &[1, 2, 3]);
        bad.replace_range(bad.len() - 2.., "00");
        let text = image(&[bad]);

        let err = segment(&text).unwrap_err();

        assert_eq!(err.line, 2);
        assert!(matches!(err.kind, ParseErrorKind::Checksum { found: 0, .. }));
    }

    #[test]
    fn test_length_mismatch() {
        let err = segment("S20600001000EA").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::LengthMismatch { .. }));
    }

    #[test]
    fn test_misplaced_framing_records() {
        let text = [
            record('2', 0x10, &[1]),
            record('0', 0, b"HDR"),
            record('2', 0x11, &[2]),
        ]
        .join("\n");
        assert_eq!(
            segment(&text).unwrap_err(),
            ParseErrorKind::MisplacedHeader.at(2)
        );

        let text = [
            record('2', 0x10, &[1]),
            record('8', 0, &[]),
            record('2', 0x11, &[2]),
        ]
        .join("\n");
        assert_eq!(
            segment(&text).unwrap_err(),
            ParseErrorKind::MisplacedTermination.at(2)
        );
    }

    #[test]
    fn test_overlapping_blocks_rejected() {
        let text = image(&[
            record('2', 0x1000, &[0; 16]),
            record('2', 0x2000, &[0; 4]),
            record('2', 0x1008, &[0; 4]),
        ]);

        let err = segment(&text).unwrap_err();

        assert_eq!(err.line, 4);
        assert_eq!(
            err.kind,
            ParseErrorKind::Overlap {
                address: 0x1008,
                other_line: 2
            }
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.s19");
        std::fs::write(&path, image(&[record('2', 0x1000, &[1, 2, 3, 4])])).unwrap();

        let image = FirmwareImage::load(&path).unwrap();

        assert_eq!(image.blocks().len(), 1);
        assert_eq!(image.total_size(), 4);
    }
}
