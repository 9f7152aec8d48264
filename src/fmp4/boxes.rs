//! ISOBMFF (MP4) box parsing and serialization utilities.
//!
//! Each box follows the standard layout: 4-byte size (big-endian u32),
//! 4-byte type (ASCII), then box-specific content. A size of 1 means a
//! 64-bit size follows the type; a size of 0 means the box runs to the end
//! of the file.

use std::io::{self, Read};

use crate::error::{PlaybackError, Result};

/// Header of a box read from a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: [u8; 4],
    /// Total box size including the header, `None` when it extends to EOF
    pub size: Option<u64>,
    /// Length of the header itself (8 or 16)
    pub header_len: u64,
}

impl BoxHeader {
    /// Payload size, if known
    pub fn payload_len(&self) -> Option<u64> {
        self.size.map(|s| s - self.header_len)
    }

    pub fn type_str(&self) -> String {
        String::from_utf8_lossy(&self.box_type).into_owned()
    }
}

fn read_full_or_eof<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated box header",
                ))
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Read the next box header. Returns `None` on a clean end of stream.
pub fn read_box_header<R: Read + ?Sized>(r: &mut R) -> Result<Option<BoxHeader>> {
    let mut buf = [0u8; 8];
    let has_box = read_full_or_eof(r, &mut buf).map_err(truncated)?;
    if !has_box {
        return Ok(None);
    }

    let size32 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let box_type = [buf[4], buf[5], buf[6], buf[7]];

    let (size, header_len) = match size32 {
        0 => (None, 8),
        1 => {
            let mut large = [0u8; 8];
            r.read_exact(&mut large).map_err(truncated)?;
            (Some(u64::from_be_bytes(large)), 16)
        }
        s => (Some(s as u64), 8),
    };

    if let Some(s) = size {
        if s < header_len {
            return Err(PlaybackError::MalformedContainer(format!(
                "box '{}' has invalid size {}",
                String::from_utf8_lossy(&box_type),
                s
            )));
        }
    }

    Ok(Some(BoxHeader {
        box_type,
        size,
        header_len,
    }))
}

/// Read a box payload into memory.
pub fn read_payload<R: Read + ?Sized>(r: &mut R, header: &BoxHeader) -> Result<Vec<u8>> {
    let len = header.payload_len().ok_or_else(|| {
        PlaybackError::MalformedContainer(format!(
            "box '{}' has no explicit size",
            header.type_str()
        ))
    })?;
    // Metadata boxes are small; refuse absurd sizes instead of allocating them.
    if len > 64 * 1024 * 1024 {
        return Err(PlaybackError::MalformedContainer(format!(
            "box '{}' is too large ({} bytes)",
            header.type_str(),
            len
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).map_err(truncated)?;
    Ok(payload)
}

fn truncated(e: io::Error) -> PlaybackError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        PlaybackError::MalformedContainer("unexpected end of file".into())
    } else {
        PlaybackError::Io(e)
    }
}

/// Walk all boxes in a buffer, and recursively traverse specified container boxes.
/// `callback` is invoked for EVERY box in pre-order traversal.
pub fn walk_boxes<'a, F>(data: &'a [u8], containers: &[&[u8; 4]], callback: &mut F) -> Result<()>
where
    F: FnMut(&[u8; 4], &'a [u8]) -> Result<()>,
{
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let size =
            u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        if size < 8 || pos + size > data.len() {
            return Err(PlaybackError::MalformedContainer(format!(
                "box at offset {} overruns its parent",
                pos
            )));
        }
        let btype = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];
        let payload = &data[pos + 8..pos + size];

        callback(&btype, payload)?;

        if containers.contains(&&btype) {
            walk_boxes(payload, containers, callback)?;
        }

        pos += size;
    }
    Ok(())
}

/// Bounds-checked big-endian reader over a box payload
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], context: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            context,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(PlaybackError::MalformedContainer(format!(
                "{} is truncated",
                self.context
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Version and 24-bit flags of a full box
    pub fn full_box_header(&mut self) -> Result<(u8, u32)> {
        let v = self.u32()?;
        Ok(((v >> 24) as u8, v & 0x00FF_FFFF))
    }
}

// ---------------------------------------------------------------------------
// Low-level box writing helpers
// ---------------------------------------------------------------------------

/// Write a complete box: size (u32 BE) + type (4 ASCII bytes) + content.
pub fn write_box(box_type: &[u8; 4], content: &[u8]) -> Vec<u8> {
    let size = (8 + content.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(box_type);
    out.extend_from_slice(content);
    out
}

/// Write a container box (size + type + children concatenated).
pub fn write_container_box(box_type: &[u8; 4], children: &[&[u8]]) -> Vec<u8> {
    let children_len: usize = children.iter().map(|c| c.len()).sum();
    let size = (8 + children_len) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(box_type);
    for child in children {
        out.extend_from_slice(child);
    }
    out
}

/// Header of an `mdat` box holding `payload_len` bytes, 64-bit when needed.
pub fn mdat_header(payload_len: u64) -> Vec<u8> {
    if payload_len + 8 <= u32::MAX as u64 {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&((payload_len + 8) as u32).to_be_bytes());
        out.extend_from_slice(b"mdat");
        out
    } else {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(b"mdat");
        out.extend_from_slice(&(payload_len + 16).to_be_bytes());
        out
    }
}

/// Full box header (version + flags).
pub fn fullbox_header(version: u8, flags: u32) -> [u8; 4] {
    let val = ((version as u32) << 24) | (flags & 0x00FF_FFFF);
    val.to_be_bytes()
}

/// `ftyp` box. Major brand "iso8", compatible brands for fragmented and
/// progressive readers.
pub fn write_ftyp() -> Vec<u8> {
    let mut content = Vec::with_capacity(24);
    content.extend_from_slice(b"iso8");
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(b"iso8");
    content.extend_from_slice(b"isom");
    content.extend_from_slice(b"mp41");
    content.extend_from_slice(b"dash");
    write_box(b"ftyp", &content)
}
