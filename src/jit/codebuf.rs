//! Bounds-checked write cursors over the sections of a JIT region.
//!
//! Stencils are copied back to back. A stencil may write a few bytes past its
//! nominal end (its tail is then overwritten by the next stencil), so every
//! section carries [`SECTION_SLACK`] bytes of writable padding. The cursor
//! itself can never move into the padding.

/// Bytes an emitter may write past its nominal end.
pub const SECTION_SLACK: usize = 7;

/// Write cursor over one section.
#[derive(Debug)]
pub struct SectionWriter<'a> {
    buf: &'a mut [u8],
    /// Offset of `buf[0]` within the whole region
    base: usize,
    pos: usize,
    /// Nominal end of the section; `buf.len() - limit` is the writable slack
    limit: usize,
}

impl<'a> SectionWriter<'a> {
    /// `buf` covers the section plus its slack.
    pub fn new(buf: &'a mut [u8], base: usize, limit: usize) -> Self {
        assert!(limit <= buf.len(), "section limit {} past buffer of {}", limit, buf.len());
        Self {
            buf,
            base,
            pos: 0,
            limit,
        }
    }

    /// Cursor position relative to the section start.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Cursor position relative to the region start.
    pub fn region_offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Write `bytes` at the cursor without moving it. May spill into the slack.
    pub fn write(&mut self, bytes: &[u8]) {
        self.write_at(self.pos, bytes);
    }

    /// Write `bytes` at a section-relative offset without moving the cursor.
    pub fn write_at(&mut self, at: usize, bytes: &[u8]) {
        let end = at + bytes.len();
        assert!(
            end <= self.buf.len(),
            "write of {} bytes at {} overruns section (limit {}, slack {})",
            bytes.len(),
            at,
            self.limit,
            self.buf.len() - self.limit
        );
        self.buf[at..end].copy_from_slice(bytes);
    }

    pub fn advance(&mut self, n: usize) {
        assert!(
            self.pos + n <= self.limit,
            "cursor moved to {} past section end {}",
            self.pos + n,
            self.limit
        );
        self.pos += n;
    }

    /// Write `bytes` at the cursor and move past them.
    pub fn emit(&mut self, bytes: &[u8]) {
        self.write(bytes);
        self.advance(bytes.len());
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.emit(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.emit(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.emit(&value.to_le_bytes());
    }

    /// Overwrite 4 bytes at a section-relative offset.
    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.write_at(at, &value.to_le_bytes());
    }

    /// Move the cursor to the next multiple of `align` (relative to the region).
    pub fn align_to(&mut self, align: usize) {
        debug_assert!(align.is_power_of_two());
        let target = self.region_offset().next_multiple_of(align) - self.base;
        self.advance(target - self.pos);
    }
}

/// Split `region` into data, fast path and slow path writers.
///
/// Each range is `(start, nominal_len)`; the writer may touch `nominal_len +
/// SECTION_SLACK` bytes. Ranges must be ordered and their slack must not
/// overlap the next range.
pub fn split_sections(
    region: &mut [u8],
    data: (usize, usize),
    fast: (usize, usize),
    slow: (usize, usize),
) -> (SectionWriter<'_>, SectionWriter<'_>, SectionWriter<'_>) {
    let data_end = if data.1 == 0 { data.0 } else { data.0 + data.1 + SECTION_SLACK };
    assert!(data_end <= fast.0, "data section overlaps fast path");
    assert!(fast.0 + fast.1 + SECTION_SLACK <= slow.0, "fast path overlaps slow path");
    assert!(slow.0 + slow.1 + SECTION_SLACK <= region.len(), "slow path past region end");

    let (head, rest) = region.split_at_mut(fast.0);
    let (fast_buf, slow_buf) = rest.split_at_mut(slow.0 - fast.0);
    let data_buf = &mut head[data.0..data_end];
    let fast_len = fast.1 + SECTION_SLACK;
    let slow_len = slow.1 + SECTION_SLACK;
    (
        SectionWriter::new(data_buf, data.0, data.1),
        SectionWriter::new(&mut fast_buf[..fast_len], fast.0, fast.1),
        SectionWriter::new(&mut slow_buf[..slow_len], slow.0, slow.1),
    )
}
