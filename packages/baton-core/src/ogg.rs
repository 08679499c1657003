//! Minimal Ogg page and packet parsing for the transcoder output.
//!
//! The transcoder emits Opus inside an Ogg container. Two consumers need
//! structure-aware access to that byte stream:
//!
//! - the `opus-container` path must chunk transport writes on page
//!   boundaries so no logical Opus frame is split across two records;
//! - the `raw-opus` path must extract individual 20 ms Opus packets, one
//!   per record, skipping the `OpusHead`/`OpusTags` header packets.
//!
//! Page CRCs are not verified: the stream comes from a local pipe, not a
//! network, and a corrupt pipe already fails the session.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Ogg page capture pattern.
const CAPTURE_PATTERN: &[u8; 4] = b"OggS";

/// Fixed page header length before the segment table (bytes).
const PAGE_HEADER_LEN: usize = 27;

/// Header-type flag: this page continues a packet from the previous page.
const FLAG_CONTINUED: u8 = 0x01;

/// Incremental splitter that yields complete Ogg pages from a byte stream.
///
/// Bytes that precede a capture pattern (junk after a resync) are discarded
/// with a log line.
#[derive(Default)]
pub struct OggPageSplitter {
    buf: BytesMut,
}

/// One complete page: raw bytes plus the parsed segment structure.
pub struct OggPage {
    /// The entire page, header included, exactly as read.
    pub raw: Bytes,
    /// Header-type flags byte.
    pub header_type: u8,
    /// Lacing values from the segment table.
    pub lacing: Vec<u8>,
    /// Offset of the body within `raw`.
    pub body_offset: usize,
}

impl OggPageSplitter {
    /// Creates an empty splitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the transcoder pipe.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete page, or `None` if more bytes are needed.
    pub fn next_page(&mut self) -> Option<OggPage> {
        self.resync();

        if self.buf.len() < PAGE_HEADER_LEN {
            return None;
        }

        let n_segments = self.buf[26] as usize;
        let table_end = PAGE_HEADER_LEN + n_segments;
        if self.buf.len() < table_end {
            return None;
        }

        let lacing: Vec<u8> = self.buf[PAGE_HEADER_LEN..table_end].to_vec();
        let body_len: usize = lacing.iter().map(|&l| l as usize).sum();
        let page_len = table_end + body_len;
        if self.buf.len() < page_len {
            return None;
        }

        let header_type = self.buf[5];
        let raw = self.buf.split_to(page_len).freeze();
        Some(OggPage {
            raw,
            header_type,
            lacing,
            body_offset: table_end,
        })
    }

    /// Drops bytes until the buffer starts with the capture pattern.
    fn resync(&mut self) {
        if self.buf.len() >= 4 && &self.buf[..4] == CAPTURE_PATTERN {
            return;
        }
        if let Some(pos) = self
            .buf
            .windows(4)
            .position(|w| w == CAPTURE_PATTERN)
        {
            if pos > 0 {
                log::warn!("[Ogg] Dropping {pos} bytes before capture pattern");
                let _ = self.buf.split_to(pos);
            }
        } else if self.buf.len() > 3 {
            // Keep the last 3 bytes in case the pattern straddles a read
            let keep = self.buf.len() - 3;
            let _ = self.buf.split_to(keep);
        }
    }
}

/// Incremental reader that yields logical Ogg packets (Opus frames).
///
/// Packets spanning multiple pages (lacing value 255 at page end plus the
/// continued flag) are reassembled.
#[derive(Default)]
pub struct OggPacketReader {
    splitter: OggPageSplitter,
    partial: Vec<u8>,
    ready: VecDeque<Bytes>,
}

impl OggPacketReader {
    /// Creates an empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes and assembles any packets they complete.
    pub fn push(&mut self, data: &[u8]) {
        self.splitter.push(data);
        while let Some(page) = self.splitter.next_page() {
            self.absorb_page(&page);
        }
    }

    /// Returns the next assembled packet, if any.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        self.ready.pop_front()
    }

    fn absorb_page(&mut self, page: &OggPage) {
        if page.header_type & FLAG_CONTINUED == 0 && !self.partial.is_empty() {
            // The previous packet never terminated; the stream skipped.
            log::warn!(
                "[Ogg] Discarding {} partial bytes at page boundary",
                self.partial.len()
            );
            self.partial.clear();
        }

        let body = &page.raw[page.body_offset..];
        let mut offset = 0usize;
        for &lacing in &page.lacing {
            let len = lacing as usize;
            self.partial.extend_from_slice(&body[offset..offset + len]);
            offset += len;
            if lacing < 255 {
                self.ready
                    .push_back(Bytes::from(std::mem::take(&mut self.partial)));
            }
        }
    }
}

/// Returns true for the `OpusHead`/`OpusTags` header packets that must not
/// be forwarded as audio frames.
#[must_use]
pub fn is_opus_header(packet: &[u8]) -> bool {
    packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags")
}
