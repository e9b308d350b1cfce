//! Physical memory image to bitmap crash-dump conversion.
//!
//! Layout of the produced file (all integers little endian):
//!
//! | offset | size | content                                     |
//! |--------|------|---------------------------------------------|
//! | 0      | 4    | `PAGE`                                      |
//! | 4      | 4    | `DU64`                                      |
//! | 3992   | 4    | dump type (5, bitmap dump)                  |
//! | 8192   | 8    | `SDMP` `DUMP`                               |
//! | 8224   | 8    | offset of the first page                    |
//! | 8240   | 8    | page count                                  |
//! | 8248   | n    | presence bitmap, one bit per page, all set  |
//! | ...    |      | raw 4 KiB pages                             |

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::{CaptureError, CaptureResult};

pub const PAGE_SIZE: u64 = 0x1000;
pub const HEADER64_SIZE: usize = 8248;
pub const BMP_HEADER64_SIZE: usize = 56;
pub const DUMP_TYPE_BMP: u32 = 5;
/// Page payload is copied in chunks of this size.
pub const COPY_CHUNK_SIZE: usize = 10 * (1 << 20);

const SIGNATURE: &[u8; 4] = b"PAGE";
const VALID_DUMP: &[u8; 4] = b"DU64";
const BMP_SIGNATURE: &[u8; 4] = b"SDMP";
const BMP_VALID_DUMP: &[u8; 4] = b"DUMP";

const DUMP_TYPE_OFFSET: usize = 3992;
const BMP_HEADER_OFFSET: usize = 8192;
const BMP_FIRST_PAGE_OFFSET: usize = 32;
const BMP_PAGES_OFFSET: usize = 48;

const _: () = assert!(DUMP_TYPE_OFFSET + 4 <= BMP_HEADER_OFFSET);
const _: () = assert!(BMP_HEADER_OFFSET + BMP_HEADER64_SIZE == HEADER64_SIZE);
const _: () = assert!(BMP_FIRST_PAGE_OFFSET + 8 <= BMP_PAGES_OFFSET);
const _: () = assert!(BMP_PAGES_OFFSET + 8 == BMP_HEADER64_SIZE);
const _: () = assert!(COPY_CHUNK_SIZE % PAGE_SIZE as usize == 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpLayout {
    pub pages: u64,
    pub bitmap_len: u64,
}

impl DumpLayout {
    pub fn for_raw_size(raw_size: u64) -> CaptureResult<Self> {
        let pages = raw_size / PAGE_SIZE;
        if pages == 0 {
            return Err(CaptureError::EmptyImage(raw_size));
        }
        if raw_size % PAGE_SIZE != 0 {
            tracing::warn!(
                "Raw image size {:#x} is not page aligned, dropping the trailing {} bytes",
                raw_size,
                raw_size % PAGE_SIZE
            );
        }
        Ok(Self {
            pages,
            bitmap_len: pages.div_ceil(8),
        })
    }

    pub fn first_page_offset(&self) -> u64 {
        HEADER64_SIZE as u64 + self.bitmap_len
    }

    pub fn file_size(&self) -> u64 {
        self.first_page_offset() + self.pages * PAGE_SIZE
    }

    /// Header, bitmap header and presence bitmap, ready to be written.
    pub fn encode_header(&self) -> CaptureResult<Vec<u8>> {
        let mut d = Vec::with_capacity(self.first_page_offset() as usize);
        d.extend_from_slice(SIGNATURE);
        d.extend_from_slice(VALID_DUMP);
        d.resize(DUMP_TYPE_OFFSET, 0);
        d.extend_from_slice(&DUMP_TYPE_BMP.to_le_bytes());
        d.resize(BMP_HEADER_OFFSET, 0);
        check_len(&d, BMP_HEADER_OFFSET, "primary header")?;

        let mut b = Vec::with_capacity(BMP_HEADER64_SIZE);
        b.extend_from_slice(BMP_SIGNATURE);
        b.extend_from_slice(BMP_VALID_DUMP);
        b.resize(BMP_FIRST_PAGE_OFFSET, 0);
        b.extend_from_slice(&self.first_page_offset().to_le_bytes());
        b.resize(BMP_PAGES_OFFSET, 0);
        b.extend_from_slice(&self.pages.to_le_bytes());
        check_len(&b, BMP_HEADER64_SIZE, "bitmap header")?;

        d.extend_from_slice(&b);
        check_len(&d, HEADER64_SIZE, "dump header")?;

        d.resize(d.len() + self.bitmap_len as usize, 0xff);
        check_len(&d, self.first_page_offset() as usize, "presence bitmap")?;
        Ok(d)
    }
}

fn check_len(buf: &[u8], expected: usize, what: &str) -> CaptureResult<()> {
    if buf.len() != expected {
        return Err(CaptureError::FormatInvariant(format!(
            "{} is {} bytes, expected {}",
            what,
            buf.len(),
            expected
        )));
    }
    Ok(())
}

/// Write the header followed by `layout.pages` pages read from `raw`.
/// Returns the number of bytes written.
pub fn write_dump<R: Read, W: Write>(
    raw: R,
    out: &mut W,
    layout: &DumpLayout,
) -> CaptureResult<u64> {
    let header = layout.encode_header()?;
    out.write_all(&header)?;

    let payload_len = layout.pages * PAGE_SIZE;
    let mut payload = raw.take(payload_len);
    let mut chunk = vec![0u8; COPY_CHUNK_SIZE.min(payload_len as usize)];
    let mut copied = 0u64;
    loop {
        let n = fill(&mut payload, &mut chunk)?;
        if n == 0 {
            break;
        }
        out.write_all(&chunk[..n])?;
        copied += n as u64;
    }
    out.flush()?;

    if copied != payload_len {
        return Err(CaptureError::FormatInvariant(format!(
            "copied {:#x} payload bytes, expected {:#x}",
            copied, payload_len
        )));
    }
    Ok(header.len() as u64 + copied)
}

fn fill<R: Read>(src: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Convert the raw image at `raw_path` into `out_path`, then delete the raw file.
pub fn convert_raw_to_dmp(raw_path: &Path, out_path: &Path) -> CaptureResult<DumpLayout> {
    let raw_size = std::fs::metadata(raw_path)?.len();
    let layout = DumpLayout::for_raw_size(raw_size)?;

    tracing::info!(
        "Converting raw file {:?} to dump file {:?} ({} pages)",
        raw_path,
        out_path,
        layout.pages
    );

    let raw = File::open(raw_path)?;
    let mut out = BufWriter::new(File::create(out_path)?);
    let written = write_dump(raw, &mut out, &layout)?;
    out.into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;

    if written != layout.file_size() {
        return Err(CaptureError::FormatInvariant(format!(
            "wrote {} bytes, expected {}",
            written,
            layout.file_size()
        )));
    }

    std::fs::remove_file(raw_path)?;
    tracing::debug!("Removed raw file {:?}", raw_path);
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(count: u64) -> Vec<u8> {
        (0..count * PAGE_SIZE).map(|i| (i / PAGE_SIZE) as u8).collect()
    }

    #[test]
    fn test_two_page_image() {
        let raw = pages(2);
        let layout = DumpLayout::for_raw_size(raw.len() as u64).unwrap();
        let mut out = Vec::new();
        let written = write_dump(&raw[..], &mut out, &layout).unwrap();

        assert_eq!(written, 16441);
        assert_eq!(out.len(), 8248 + 1 + 8192);
        assert_eq!(out[8248], 0xff);
        assert_eq!(&out[8249..], &raw[..]);
    }

    #[test]
    fn test_header_fields() {
        let layout = DumpLayout::for_raw_size(9 * PAGE_SIZE).unwrap();
        let header = layout.encode_header().unwrap();

        assert_eq!(&header[0..4], b"PAGE");
        assert_eq!(&header[4..8], b"DU64");
        assert_eq!(&header[3992..3996], &5u32.to_le_bytes());
        assert_eq!(&header[8192..8196], b"SDMP");
        assert_eq!(&header[8196..8200], b"DUMP");
        assert!(header[8200..8224].iter().all(|&b| b == 0));
        assert_eq!(&header[8224..8232], &(8248u64 + 2).to_le_bytes());
        assert_eq!(&header[8240..8248], &9u64.to_le_bytes());
        assert_eq!(&header[8248..], &[0xff, 0xff]);
    }

    #[test]
    fn test_output_size_for_page_counts() {
        for p in [1u64, 7, 8, 9, 63, 64, 65, 1000] {
            let layout = DumpLayout::for_raw_size(p * PAGE_SIZE).unwrap();
            let mut out = Vec::new();
            write_dump(&pages(p)[..], &mut out, &layout).unwrap();
            assert_eq!(out.len() as u64, 8248 + p.div_ceil(8) + p * PAGE_SIZE);
            let bitmap = &out[HEADER64_SIZE..HEADER64_SIZE + layout.bitmap_len as usize];
            assert!(bitmap.iter().all(|&b| b == 0xff));
        }
    }

    #[test]
    fn test_partial_trailing_page_dropped() {
        let mut raw = pages(3);
        raw.extend_from_slice(&[0xAA; 100]);
        let layout = DumpLayout::for_raw_size(raw.len() as u64).unwrap();
        assert_eq!(layout.pages, 3);
        let mut out = Vec::new();
        write_dump(&raw[..], &mut out, &layout).unwrap();
        assert_eq!(out.len() as u64, layout.file_size());
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(matches!(
            DumpLayout::for_raw_size(4095),
            Err(CaptureError::EmptyImage(4095))
        ));
    }

    #[test]
    fn test_truncated_source_is_invariant_error() {
        let layout = DumpLayout::for_raw_size(4 * PAGE_SIZE).unwrap();
        let mut out = Vec::new();
        let err = write_dump(&pages(2)[..], &mut out, &layout).unwrap_err();
        assert!(matches!(err, CaptureError::FormatInvariant(_)));
    }

    #[test]
    fn test_convert_removes_raw_file() {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("qsnap-dump-{}", nonce));
        std::fs::create_dir_all(&dir).unwrap();
        let raw_path = dir.join("raw");
        let out_path = dir.join("mem.dmp");
        std::fs::write(&raw_path, pages(2)).unwrap();

        let layout = convert_raw_to_dmp(&raw_path, &out_path).unwrap();
        assert_eq!(layout.pages, 2);
        assert!(!raw_path.exists());
        assert_eq!(std::fs::metadata(&out_path).unwrap().len(), 16441);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
