#![forbid(unsafe_code)]
//! Image access layer: the qcow2 host file plus its allocation map.
//!
//! `QcowImage` owns a read-only handle to the qcow2 host file and the
//! ordered segment list obtained from `qemu-img map`. Its one operation
//! is `read_at`: fill a buffer from a virtual offset, scatter-gathering
//! across backed segments and materialising zeros for discarded ranges.
//! Reads use positional I/O; the handle lives for the whole run.

pub mod map;

use qba_error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

/// One virtual-offset range of the image.
///
/// Segments are contiguous, non-overlapping, sorted by `start`, and
/// together cover `[0, virtual_size)`. If `zero` is set the segment reads
/// as zeros and `offset` is absent; otherwise byte `v` of the range is at
/// host-file offset `offset + (v - start)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcowSegment {
    pub start: u64,
    pub length: u64,
    pub zero: bool,
    pub offset: Option<u64>,
}

impl QcowSegment {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Whether the host backs this range with real data (`!zero`).
    #[must_use]
    pub fn allocated(&self) -> bool {
        !self.zero
    }
}

/// Read-only random access over the virtual device.
///
/// Implemented by `QcowImage` for real qcow2 files and by `MemImage` for
/// in-memory fixtures.
pub trait VirtualRead {
    /// Total virtual size in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes starting at `offset`, or fail.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// A qcow2 image opened for auditing: host file handle + segment map.
#[derive(Debug)]
pub struct QcowImage {
    file: File,
    file_len: u64,
    segments: Vec<QcowSegment>,
    virtual_size: u64,
}

impl QcowImage {
    /// Open the host file read-only and obtain the segment list by
    /// invoking `qemu-img map --output json`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options().read(true).open(path)?;
        let file_len = file.metadata()?.len();

        let json = map::invoke_qemu_img_map(path)?;
        let entries = map::parse_map(&json)?;
        let segments = map::segments_from_entries(&entries)?;

        Self::from_parts(file, file_len, segments)
    }

    fn from_parts(file: File, file_len: u64, segments: Vec<QcowSegment>) -> Result<Self> {
        let virtual_size = segments.last().map_or(0, QcowSegment::end);
        debug!(
            virtual_size = format_args!("{virtual_size:#x}"),
            host_len = format_args!("{file_len:#x}"),
            "opened qcow image"
        );
        Ok(Self {
            file,
            file_len,
            segments,
            virtual_size,
        })
    }

    /// The ordered segment list.
    #[must_use]
    pub fn segments(&self) -> &[QcowSegment] {
        &self.segments
    }

    /// Index of the segment covering `offset`, if any.
    fn segment_covering(&self, offset: u64) -> Option<&QcowSegment> {
        let idx = self.segments.partition_point(|seg| seg.start <= offset);
        if idx == 0 {
            return None;
        }
        let seg = &self.segments[idx - 1];
        (offset < seg.end()).then_some(seg)
    }
}

impl VirtualRead for QcowImage {
    fn len_bytes(&self) -> u64 {
        self.virtual_size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut pos = offset;
        let mut remaining = buf;

        while !remaining.is_empty() {
            let Some(seg) = self.segment_covering(pos) else {
                return Err(AuditError::Map(format!(
                    "virtual offset {pos:x} is not covered by the qcow map"
                )));
            };

            let avail = seg.end() - pos;
            let take = usize::try_from(avail.min(remaining.len() as u64)).map_err(|_| {
                AuditError::Map(format!("read at {pos:x} exceeds addressable memory"))
            })?;
            let (chunk, rest) = remaining.split_at_mut(take);

            if seg.zero {
                chunk.fill(0);
            } else {
                // Validated at map load: non-zero segments carry an offset.
                let base = seg.offset.ok_or_else(|| {
                    AuditError::Map(format!("segment at {:x} has no host offset", seg.start))
                })?;
                let host_off = base + (pos - seg.start);
                let host_end = host_off + chunk.len() as u64;
                if host_end > self.file_len {
                    return Err(AuditError::Map(format!(
                        "segment at {:x} points past the end of the host file \
                         (host offset {host_off:x} + {:x} > {:x})",
                        seg.start,
                        chunk.len(),
                        self.file_len
                    )));
                }
                self.file.read_exact_at(chunk, host_off)?;
            }

            pos += take as u64;
            remaining = rest;
        }

        Ok(())
    }
}

/// An in-memory virtual device, used by tests and the e2e harness.
#[derive(Debug, Clone, Default)]
pub struct MemImage {
    bytes: Vec<u8>,
}

impl MemImage {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl VirtualRead for MemImage {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| AuditError::Map(format!("offset {offset:x} out of range")))?;
        let end = start.checked_add(buf.len()).filter(|end| *end <= self.bytes.len());
        let Some(end) = end else {
            return Err(AuditError::Map(format!(
                "read at {offset:x}, {:x} past end of image ({:x})",
                buf.len(),
                self.bytes.len()
            )));
        };
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_host_file(content: &[u8]) -> (tempfile::NamedTempFile, File, u64) {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.write_all(content).expect("write");
        tmp.flush().expect("flush");
        let file = File::options().read(true).open(tmp.path()).expect("open");
        let len = content.len() as u64;
        (tmp, file, len)
    }

    fn image_with(segments: Vec<QcowSegment>, host: &[u8]) -> (tempfile::NamedTempFile, QcowImage) {
        let (tmp, file, len) = make_host_file(host);
        let image = QcowImage::from_parts(file, len, segments).expect("image");
        (tmp, image)
    }

    #[test]
    fn read_within_one_data_segment() {
        // Virtual [0, 16) backed at host offset 4.
        let host: Vec<u8> = (0_u8..32).collect();
        let (_tmp, image) = image_with(
            vec![QcowSegment {
                start: 0,
                length: 16,
                zero: false,
                offset: Some(4),
            }],
            &host,
        );

        let mut buf = [0_u8; 8];
        image.read_at(2, &mut buf).expect("read");
        assert_eq!(buf, [6, 7, 8, 9, 10, 11, 12, 13]);
        assert_eq!(image.len_bytes(), 16);
    }

    #[test]
    fn read_scatter_gathers_across_segments() {
        // [0,8) data at host 0; [8,16) zero; [16,24) data at host 8.
        let host: Vec<u8> = (1_u8..=16).collect();
        let (_tmp, image) = image_with(
            vec![
                QcowSegment {
                    start: 0,
                    length: 8,
                    zero: false,
                    offset: Some(0),
                },
                QcowSegment {
                    start: 8,
                    length: 8,
                    zero: true,
                    offset: None,
                },
                QcowSegment {
                    start: 16,
                    length: 8,
                    zero: false,
                    offset: Some(8),
                },
            ],
            &host,
        );

        let mut buf = [0xAA_u8; 24];
        image.read_at(0, &mut buf).expect("read");
        assert_eq!(&buf[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[8..16], &[0; 8]);
        assert_eq!(&buf[16..], &[9, 10, 11, 12, 13, 14, 15, 16]);
    }

    #[test]
    fn read_fails_past_coverage() {
        let host = [0_u8; 16];
        let (_tmp, image) = image_with(
            vec![QcowSegment {
                start: 0,
                length: 16,
                zero: false,
                offset: Some(0),
            }],
            &host,
        );

        let mut buf = [0_u8; 8];
        let err = image.read_at(12, &mut buf).unwrap_err();
        assert!(err.to_string().contains("not covered"));
    }

    #[test]
    fn read_fails_when_segment_points_past_host_file() {
        let host = [0_u8; 8];
        let (_tmp, image) = image_with(
            vec![QcowSegment {
                start: 0,
                length: 16,
                zero: false,
                offset: Some(0),
            }],
            &host,
        );

        let mut buf = [0_u8; 16];
        let err = image.read_at(0, &mut buf).unwrap_err();
        assert!(err.to_string().contains("past the end of the host file"));
    }

    #[test]
    fn mem_image_reads_and_bounds() {
        let image = MemImage::new((0_u8..64).collect());
        let mut buf = [0_u8; 4];
        image.read_at(10, &mut buf).expect("read");
        assert_eq!(buf, [10, 11, 12, 13]);
        assert!(image.read_at(62, &mut buf).is_err());
        assert_eq!(image.len_bytes(), 64);
    }
}
