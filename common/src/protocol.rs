//! Protocol frame header (spec.md §6): `{cmd:u16, status:u16, body_len:u32}`
//! followed by the body. All integers big-endian.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::Error;

pub const HEADER_LEN: usize = 8;

/// Commands used by the write-path/replication/recovery core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    SliceWrite = 1,
    SliceRead = 2,
    SliceAllocate = 3,
    SliceDelete = 4,
    BlockDelete = 5,
    JoinServer = 6,
    PingLeaderReq = 7,
    PushDataServerStatus = 8,
    ActiveTest = 9,
}

impl Command {
    pub fn from_u16(v: u16) -> Result<Self, Error> {
        Ok(match v {
            1 => Command::SliceWrite,
            2 => Command::SliceRead,
            3 => Command::SliceAllocate,
            4 => Command::SliceDelete,
            5 => Command::BlockDelete,
            6 => Command::JoinServer,
            7 => Command::PingLeaderReq,
            8 => Command::PushDataServerStatus,
            9 => Command::ActiveTest,
            other => return Err(Error::Invalid(format!("unknown command code {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub cmd: Command,
    pub status: u16,
    pub body_len: u32,
}

impl FrameHeader {
    pub fn new(cmd: Command, status: u16, body_len: u32) -> Self {
        Self {
            cmd,
            status,
            body_len,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<BigEndian>(self.cmd as u16)?;
        w.write_u16::<BigEndian>(self.status)?;
        w.write_u32::<BigEndian>(self.body_len)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, Error> {
        let cmd = Command::from_u16(r.read_u16::<BigEndian>()?)?;
        let status = r.read_u16::<BigEndian>()?;
        let body_len = r.read_u32::<BigEndian>()?;
        Ok(Self {
            cmd,
            status,
            body_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let hdr = FrameHeader::new(Command::SliceWrite, 0, 4096);
        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        // big-endian: high byte of cmd=1 first
        assert_eq!(&buf[0..2], &[0x00, 0x01]);

        let mut cursor = std::io::Cursor::new(buf);
        let parsed = FrameHeader::read_from(&mut cursor).unwrap();
        assert_eq!(parsed, hdr);
    }
}
