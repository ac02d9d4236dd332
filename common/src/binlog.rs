//! The binlog record text format (spec.md §6).
//!
//! `<timestamp> <data_version> <source> <op_type> <oid> <block_offset>
//! [<slice_offset> <slice_length>]`, one record per line. Field count is
//! in `[6,16]`; the trailing two fields are only present for slice-level
//! operations. Grounded in `replica_binlog_record_unpack` as called from
//! `binlog_replay.c`'s `deal_binlog_buffer`.

use crate::keys::{BlockKey, SliceKey};
use crate::Error;

/// `op_type` values: write-slice, allocate-slice, del-slice, del-block,
/// no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    WriteSlice,
    AllocateSlice,
    DeleteSlice,
    DeleteBlock,
    NoOp,
}

impl OpType {
    pub fn as_char(&self) -> char {
        match self {
            OpType::WriteSlice => 'w',
            OpType::AllocateSlice => 'a',
            OpType::DeleteSlice => 'd',
            OpType::DeleteBlock => 'D',
            OpType::NoOp => 'N',
        }
    }

    pub fn from_char(c: char) -> Result<Self, Error> {
        Ok(match c {
            'w' => OpType::WriteSlice,
            'a' => OpType::AllocateSlice,
            'd' => OpType::DeleteSlice,
            'D' => OpType::DeleteBlock,
            'N' => OpType::NoOp,
            other => {
                return Err(Error::Invalid(format!("unknown binlog op_type: {other:?}")))
            }
        })
    }

    /// Whether this op type carries a `(slice_offset, slice_length)` pair.
    pub fn has_slice_range(&self) -> bool {
        matches!(self, OpType::WriteSlice | OpType::AllocateSlice | OpType::DeleteSlice)
    }
}

/// `source` values: RPC vs replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Rpc,
    Replay,
}

impl Source {
    pub fn as_char(&self) -> char {
        match self {
            Source::Rpc => 'C',
            Source::Replay => 'R',
        }
    }

    pub fn from_char(c: char) -> Result<Self, Error> {
        match c {
            'C' => Ok(Source::Rpc),
            'R' => Ok(Source::Replay),
            other => Err(Error::Invalid(format!("unknown binlog source: {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogRecord {
    pub timestamp: i64,
    pub data_version: u64,
    pub source: Source,
    pub op_type: OpType,
    pub block: BlockKey,
    pub slice: Option<SliceKey>,
}

impl BinlogRecord {
    /// `BINLOG_IS_INTERNAL_RECORD` iff `op_type=N ∨ data_version=0`
    /// (spec.md §6).
    pub fn is_internal(&self) -> bool {
        self.op_type == OpType::NoOp || self.data_version == 0
    }

    pub fn format(&self) -> String {
        let mut line = format!(
            "{} {} {} {} {} {}",
            self.timestamp,
            self.data_version,
            self.source.as_char(),
            self.op_type.as_char(),
            self.block.oid,
            self.block.block_offset,
        );
        if let Some(slice) = self.slice {
            line.push_str(&format!(" {} {}", slice.offset, slice.length));
        }
        line.push('\n');
        line
    }

    /// Parses a single binlog line (with or without its trailing `\n`).
    pub fn parse(line: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = line.trim_end_matches(['\n', '\r']).split(' ').collect();
        if fields.len() < 6 || fields.len() > 16 {
            return Err(Error::Invalid(format!(
                "binlog record has {} fields, expected [6,16]",
                fields.len()
            )));
        }

        let parse_i64 = |s: &str, what: &str| -> Result<i64, Error> {
            s.parse::<i64>()
                .map_err(|e| Error::Invalid(format!("bad {what} {s:?}: {e}")))
        };
        let parse_u64 = |s: &str, what: &str| -> Result<u64, Error> {
            s.parse::<u64>()
                .map_err(|e| Error::Invalid(format!("bad {what} {s:?}: {e}")))
        };
        let parse_char = |s: &str, what: &str| -> Result<char, Error> {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(c),
                _ => Err(Error::Invalid(format!("bad {what} {s:?}"))),
            }
        };

        let timestamp = parse_i64(fields[0], "timestamp")?;
        let data_version = parse_u64(fields[1], "data_version")?;
        let source = Source::from_char(parse_char(fields[2], "source")?)?;
        let op_type = OpType::from_char(parse_char(fields[3], "op_type")?)?;
        let oid = parse_i64(fields[4], "oid")?;
        let block_offset = parse_i64(fields[5], "block_offset")?;
        let block = BlockKey::new(oid, block_offset);

        let slice = if op_type.has_slice_range() {
            if fields.len() < 8 {
                return Err(Error::Invalid(
                    "op_type requires slice_offset/slice_length fields".into(),
                ));
            }
            let offset = parse_i64(fields[6], "slice_offset")? as i32;
            let length = parse_i64(fields[7], "slice_length")? as i32;
            Some(SliceKey::new(offset, length))
        } else {
            None
        };

        Ok(BinlogRecord {
            timestamp,
            data_version,
            source,
            op_type,
            block,
            slice,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_write_slice() {
        let rec = BinlogRecord {
            timestamp: 1_700_000_000,
            data_version: 42,
            source: Source::Rpc,
            op_type: OpType::WriteSlice,
            block: BlockKey::new(1, 0),
            slice: Some(SliceKey::new(0, 4096)),
        };
        let line = rec.format();
        let parsed = BinlogRecord::parse(&line).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn no_op_has_no_slice_and_is_internal() {
        let rec = BinlogRecord {
            timestamp: 1,
            data_version: 0,
            source: Source::Replay,
            op_type: OpType::NoOp,
            block: BlockKey::new(1, 0),
            slice: None,
        };
        assert!(rec.is_internal());
        let parsed = BinlogRecord::parse(&rec.format()).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn rejects_bad_field_count() {
        assert!(BinlogRecord::parse("1 2 C w 1").is_err());
    }

    #[test]
    fn rejects_unknown_op_type() {
        assert!(BinlogRecord::parse("1 2 C x 1 0").is_err());
    }
}
