#![forbid(unsafe_code)]

//! Decoder for `tcpdump -w -` output on a radiotap monitor interface.
//!
//! Stream-level problems (bad magic, wrong link type, absurd record length)
//! are `PcapStreamError` and end the capture. Frame-level problems are
//! `FrameError` and only drop the one frame.

use efferve_kernel_contracts::observation::NETWORK_NAME_MAX_LEN;

pub const PCAP_GLOBAL_HEADER_LEN: usize = 24;
pub const PCAP_RECORD_HEADER_LEN: usize = 16;
pub const LINKTYPE_IEEE802_11_RADIOTAP: u32 = 127;
pub const PCAP_MAX_CAPLEN: u32 = 262_144;

const RADIOTAP_MIN_LEN: usize = 8;
const DOT11_HEADER_LEN: usize = 24;
const RADIOTAP_FLAGS_BAD_FCS: u8 = 0x40;

// (alignment, size) of radiotap fields 0..=5: TSFT, Flags, Rate, Channel, FHSS, dBm antenna signal.
const RADIOTAP_FIELDS: [(usize, usize); 6] = [(8, 8), (1, 1), (1, 1), (2, 4), (1, 2), (1, 1)];
const RADIOTAP_BIT_FLAGS: usize = 1;
const RADIOTAP_BIT_ANTENNA_SIGNAL: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u32_at(self, buf: &[u8], at: usize) -> u32 {
        let b = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(b),
            ByteOrder::Big => u32::from_be_bytes(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapStreamHeader {
    pub byte_order: ByteOrder,
    pub nanosecond_timestamps: bool,
    pub link_type: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapRecordHeader {
    pub ts_sec: u32,
    pub ts_frac: u32,
    pub captured_len: u32,
    pub original_len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PcapStreamError {
    #[error("not a pcap stream (magic {0:#010x})")]
    BadMagic(u32),
    #[error("unsupported link type {0}, expected radiotap (127)")]
    UnsupportedLinkType(u32),
    #[error("record length {0} exceeds capture limit")]
    OversizedRecord(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated in {0}")]
    Truncated(&'static str),
    #[error("unsupported radiotap version {0}")]
    BadRadiotapVersion(u8),
    #[error("frame failed FCS check")]
    BadFcs,
    #[error("not a probe request")]
    NotProbeRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub source: [u8; 6],
    pub signal_dbm: Option<i8>,
    pub ssid: Option<String>,
}

impl ProbeRequest {
    pub fn source_address(&self) -> String {
        self.source
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

pub fn parse_global_header(
    buf: &[u8; PCAP_GLOBAL_HEADER_LEN],
) -> Result<PcapStreamHeader, PcapStreamError> {
    let magic = ByteOrder::Little.u32_at(buf, 0);
    let (byte_order, nanosecond_timestamps) = match magic {
        0xa1b2_c3d4 => (ByteOrder::Little, false),
        0xa1b2_3c4d => (ByteOrder::Little, true),
        0xd4c3_b2a1 => (ByteOrder::Big, false),
        0x4d3c_b2a1 => (ByteOrder::Big, true),
        other => return Err(PcapStreamError::BadMagic(other)),
    };
    // Upper bits of the link-type word may carry FCS metadata.
    let link_type = byte_order.u32_at(buf, 20) & 0x0fff_ffff;
    if link_type != LINKTYPE_IEEE802_11_RADIOTAP {
        return Err(PcapStreamError::UnsupportedLinkType(link_type));
    }
    Ok(PcapStreamHeader {
        byte_order,
        nanosecond_timestamps,
        link_type,
    })
}

impl PcapStreamHeader {
    pub fn parse_record_header(
        &self,
        buf: &[u8; PCAP_RECORD_HEADER_LEN],
    ) -> Result<PcapRecordHeader, PcapStreamError> {
        let h = PcapRecordHeader {
            ts_sec: self.byte_order.u32_at(buf, 0),
            ts_frac: self.byte_order.u32_at(buf, 4),
            captured_len: self.byte_order.u32_at(buf, 8),
            original_len: self.byte_order.u32_at(buf, 12),
        };
        if h.captured_len > PCAP_MAX_CAPLEN {
            return Err(PcapStreamError::OversizedRecord(h.captured_len));
        }
        Ok(h)
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) / align * align
}

/// Parses one radiotap-encapsulated 802.11 frame into a probe request.
pub fn parse_probe_request(frame: &[u8]) -> Result<ProbeRequest, FrameError> {
    if frame.len() < RADIOTAP_MIN_LEN {
        return Err(FrameError::Truncated("radiotap header"));
    }
    if frame[0] != 0 {
        return Err(FrameError::BadRadiotapVersion(frame[0]));
    }
    let rt_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
    if rt_len < RADIOTAP_MIN_LEN || rt_len > frame.len() {
        return Err(FrameError::Truncated("radiotap length"));
    }

    let mut offset = 4;
    let mut first_present = None;
    loop {
        if offset + 4 > rt_len {
            return Err(FrameError::Truncated("radiotap present bitmap"));
        }
        let word = ByteOrder::Little.u32_at(frame, offset);
        offset += 4;
        first_present.get_or_insert(word);
        if word & 0x8000_0000 == 0 {
            break;
        }
    }
    let present = first_present.unwrap_or(0);

    let mut signal_dbm = None;
    for (bit, (align, size)) in RADIOTAP_FIELDS.iter().enumerate() {
        if present & (1 << bit) == 0 {
            continue;
        }
        offset = align_up(offset, *align);
        if offset + size > rt_len {
            return Err(FrameError::Truncated("radiotap fields"));
        }
        if bit == RADIOTAP_BIT_FLAGS && frame[offset] & RADIOTAP_FLAGS_BAD_FCS != 0 {
            return Err(FrameError::BadFcs);
        }
        if bit == RADIOTAP_BIT_ANTENNA_SIGNAL {
            signal_dbm = Some(frame[offset] as i8);
        }
        offset += size;
    }

    let dot11 = &frame[rt_len..];
    if dot11.len() < DOT11_HEADER_LEN {
        return Err(FrameError::Truncated("802.11 header"));
    }
    let frame_type = (dot11[0] >> 2) & 0x3;
    let subtype = (dot11[0] >> 4) & 0xf;
    if frame_type != 0 || subtype != 4 {
        return Err(FrameError::NotProbeRequest);
    }
    let mut source = [0u8; 6];
    source.copy_from_slice(&dot11[10..16]);

    Ok(ProbeRequest {
        source,
        signal_dbm,
        ssid: find_ssid(&dot11[DOT11_HEADER_LEN..]),
    })
}

fn find_ssid(body: &[u8]) -> Option<String> {
    let mut i = 0;
    while i + 2 <= body.len() {
        let id = body[i];
        let len = body[i + 1] as usize;
        if i + 2 + len > body.len() {
            return None;
        }
        if id == 0 {
            let raw = String::from_utf8_lossy(&body[i + 2..i + 2 + len]);
            let ssid = truncate_on_char_boundary(raw.trim_matches('\0').trim(), NETWORK_NAME_MAX_LEN);
            return if ssid.trim().is_empty() {
                None
            } else {
                Some(ssid.trim_end().to_string())
            };
        }
        i += 2 + len;
    }
    None
}

/// Lossy decoding can triple the byte length of a garbled SSID.
fn truncate_on_char_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
