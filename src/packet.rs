use std::fmt::Debug;

use etherparse::{EtherType, Ethernet2Header, Ipv4Header};
use tokio::time::Instant;
use tracing::trace;

/// The two ECN bits of the IP DS field.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ecn {
    #[default]
    NotEct,
    Ect1,
    Ect0,
    Ce,
}

impl Ecn {
    pub fn from_dsfield(dsfield: u8) -> Self {
        match dsfield & 0x3 {
            0b01 => Ecn::Ect1,
            0b10 => Ecn::Ect0,
            0b11 => Ecn::Ce,
            _ => Ecn::NotEct,
        }
    }

    pub fn dsfield_bits(&self) -> u8 {
        match self {
            Ecn::NotEct => 0b00,
            Ecn::Ect1 => 0b01,
            Ecn::Ect0 => 0b10,
            Ecn::Ce => 0b11,
        }
    }

    /// ECT(1) and CE identify scalable (L4S) traffic; everything else,
    /// including ECT(0), is treated as Classic.
    pub fn is_l4s(&self) -> bool {
        matches!(self, Ecn::Ect1 | Ecn::Ce)
    }
}

pub trait Packet: Debug + 'static + Send {
    // Size in bytes as counted against queue and scheduler budgets
    fn length(&self) -> usize;

    // Timestamp
    fn get_timestamp(&self) -> Instant;
    fn set_timestamp(&mut self, timestamp: Instant);

    // ECN codepoint of the DS field
    fn ecn(&self) -> Ecn;
    fn set_ecn(&mut self, ecn: Ecn) -> bool;

    /// Set the ECN codepoint to CE. Not-ECT packets cannot carry a
    /// congestion mark, so marking them fails and the caller falls back
    /// to dropping.
    fn mark(&mut self) -> bool {
        if self.ecn() == Ecn::NotEct {
            return false;
        }
        self.set_ecn(Ecn::Ce)
    }
}

/// A packet backed by a raw Ethernet/IPv4 buffer.
#[derive(Clone, Debug)]
pub struct StdPacket {
    buf: Vec<u8>,
    timestamp: Instant,
}

impl StdPacket {
    pub fn from_raw_buffer(buf: &[u8]) -> Self {
        Self {
            buf: buf.to_vec(),
            timestamp: Instant::now(),
        }
    }

    pub fn with_timestamp(buf: &[u8], timestamp: Instant) -> Self {
        Self {
            buf: buf.to_vec(),
            timestamp,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    fn ipv4_payload(&self) -> Option<&[u8]> {
        let (ether_hdr, rest) = Ethernet2Header::from_slice(self.buf.as_slice()).ok()?;
        if ether_hdr.ether_type != EtherType::IPV4 {
            return None;
        }
        Some(rest)
    }
}

impl Packet for StdPacket {
    fn length(&self) -> usize {
        // 14 is the length of the Ethernet header
        self.buf.len().saturating_sub(14)
    }

    fn get_timestamp(&self) -> Instant {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: Instant) {
        self.timestamp = timestamp;
    }

    fn ecn(&self) -> Ecn {
        // Anything that does not parse as IPv4 reads as Not-ECT and is
        // treated as Classic traffic.
        let Some(ip_bytes) = self.ipv4_payload() else {
            return Ecn::NotEct;
        };
        match Ipv4Header::from_slice(ip_bytes) {
            Ok((ip_hdr, _)) => Ecn::from_dsfield(ip_hdr.ecn.value()),
            Err(_) => Ecn::NotEct,
        }
    }

    fn set_ecn(&mut self, ecn: Ecn) -> bool {
        let Some(ip_bytes) = self.ipv4_payload() else {
            return false;
        };
        if Ipv4Header::from_slice(ip_bytes).is_err() {
            return false;
        }
        // 14 is the length of the Ethernet header; the ToS byte and the
        // header checksum sit at fixed offsets behind it.
        let tos_idx = 14 + 1;
        let check_idx = 14 + 10;
        let old_tos = self.buf[tos_idx];
        let new_tos = (old_tos & !0x3) | ecn.dsfield_bits();
        if new_tos == old_tos {
            return true;
        }
        // Incremental checksum update (RFC 1624); the ToS byte is the low
        // byte of the first header word.
        let old_word = u16::from_be_bytes([self.buf[14], old_tos]);
        let new_word = u16::from_be_bytes([self.buf[14], new_tos]);
        let check_before = u16::from_be_bytes([self.buf[check_idx], self.buf[check_idx + 1]]);
        let mut sum = u32::from(!check_before) + u32::from(!old_word) + u32::from(new_word);
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        let check_after = !(sum as u16);
        self.buf[tos_idx] = new_tos;
        self.buf[check_idx..check_idx + 2].copy_from_slice(&check_after.to_be_bytes());
        trace!(?ecn, "Rewrote ECN codepoint");
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory packet with an explicit codepoint, for driving the
    /// discipline without assembling real frames.
    #[derive(Debug, Clone)]
    pub(crate) struct TestPacket {
        pub size: usize,
        pub ecn: Ecn,
        pub timestamp: Instant,
    }

    impl TestPacket {
        pub(crate) fn new(size: usize, ecn: Ecn) -> Self {
            Self {
                size,
                ecn,
                timestamp: Instant::now(),
            }
        }
    }

    impl Packet for TestPacket {
        fn length(&self) -> usize {
            self.size
        }

        fn get_timestamp(&self) -> Instant {
            self.timestamp
        }

        fn set_timestamp(&mut self, timestamp: Instant) {
            self.timestamp = timestamp;
        }

        fn ecn(&self) -> Ecn {
            self.ecn
        }

        fn set_ecn(&mut self, ecn: Ecn) -> bool {
            self.ecn = ecn;
            true
        }
    }
}
