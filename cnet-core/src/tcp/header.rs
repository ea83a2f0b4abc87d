//! TCP header framing and sequence-space arithmetic.
//!
//! Only what classification needs: ports, sequence numbers, flags, window
//! and the data offset. Options are skipped, checksums are left to the I/O
//! framework.

use bitflags::bitflags;

pub const TCP_HDR_LEN: usize = 20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes, options included.
    pub hdr_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
}

fn be16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

impl TcpHeader {
    /// Returns `None` if the buffer is shorter than a header or the data
    /// offset points outside of it.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < TCP_HDR_LEN {
            return None;
        }
        let hdr_len = usize::from(buf[12] >> 4) * 4;
        if hdr_len < TCP_HDR_LEN || hdr_len > buf.len() {
            return None;
        }
        Some(Self {
            src_port: be16(buf, 0),
            dst_port: be16(buf, 2),
            seq: be32(buf, 4),
            ack: be32(buf, 8),
            hdr_len,
            flags: TcpFlags::from_bits_truncate(buf[13]),
            window: be16(buf, 14),
        })
    }

    /// Append an option-less header.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(((TCP_HDR_LEN / 4) as u8) << 4);
        out.push(self.flags.bits());
        out.extend_from_slice(&self.window.to_be_bytes());
        // checksum, urgent pointer
        out.extend_from_slice(&[0, 0, 0, 0]);
    }
}

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_leq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

#[inline]
pub fn seq_geq(a: u32, b: u32) -> bool {
    seq_leq(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(flags: TcpFlags) -> TcpHeader {
        TcpHeader {
            src_port: 40000,
            dst_port: 80,
            seq: 0xdead_beef,
            ack: 7,
            hdr_len: TCP_HDR_LEN,
            flags,
            window: 512,
        }
    }

    #[test]
    fn write_then_parse() {
        let h = header(TcpFlags::SYN | TcpFlags::ACK);
        let mut buf = Vec::new();
        h.write(&mut buf);
        assert_eq!(buf.len(), TCP_HDR_LEN);
        assert_eq!(TcpHeader::parse(&buf), Some(h));
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(TcpHeader::parse(&[0u8; 19]).is_none());
        assert!(TcpHeader::parse(&[]).is_none());
    }

    #[test]
    fn data_offset_must_fit() {
        let mut buf = Vec::new();
        header(TcpFlags::ACK).write(&mut buf);
        // offset 4 words: shorter than the fixed header
        buf[12] = 4 << 4;
        assert!(TcpHeader::parse(&buf).is_none());
        // offset 6 words with only 20 bytes present
        buf[12] = 6 << 4;
        assert!(TcpHeader::parse(&buf).is_none());
        buf.extend_from_slice(&[1, 1, 1, 1]);
        assert_eq!(TcpHeader::parse(&buf).map(|h| h.hdr_len), Some(24));
    }

    #[test]
    fn sequence_compare_wraps() {
        assert!(seq_lt(u32::MAX - 1, 2));
        assert!(seq_gt(3, u32::MAX));
        assert!(seq_leq(5, 5));
        assert!(seq_geq(0, u32::MAX));
        assert!(!seq_lt(10, 10));
    }
}
