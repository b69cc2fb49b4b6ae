//! Byte-addressed devices over the database file.

use asupersync::Cx;
use lss_error::{LssError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| LssError::Cancelled)
}

const DEFAULT_IO_ALIGNMENT: usize = 4096;

/// Owned byte buffer whose exposed slice starts at a requested alignment.
///
/// Remains fully safe by keeping the original backing allocation and
/// exposing an aligned subslice; direct-I/O paths require the 4 KiB
/// default alignment.
#[derive(Debug, Clone)]
pub struct AlignedVec {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedVec {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, DEFAULT_IO_ALIGNMENT)
    }

    #[must_use]
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1).next_power_of_two();
        if size == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            };
        }

        let storage = vec![0_u8; size + alignment - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (alignment - 1);
        let start = if misalignment == 0 {
            0
        } else {
            alignment - misalignment
        };
        debug_assert!(start + size <= storage.len());
        Self {
            storage,
            start,
            len: size,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for AlignedVec {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for AlignedVec {}

/// Whether the underlying file honors direct I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectIo {
    Direct,
    Buffered,
}

/// Byte-addressed device with pread/pwrite semantics.
///
/// The file may grow in extent-sized steps via `set_len_bytes`; reads
/// and writes outside the current length are format errors.
pub trait ByteDevice: Send + Sync + std::fmt::Debug {
    /// Current length in bytes.
    fn len_bytes(&self) -> u64;

    /// Grow or shrink the file to exactly `len` bytes.
    fn set_len_bytes(&self, cx: &Cx, len: u64) -> Result<()>;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

impl<T: ByteDevice + ?Sized> ByteDevice for Arc<T> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn set_len_bytes(&self, cx: &Cx, len: u64) -> Result<()> {
        (**self).set_len_bytes(cx, len)
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(cx, offset, buf)
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(cx, offset, buf)
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        (**self).sync(cx)
    }
}

fn check_range(offset: u64, len: usize, file_len: u64, what: &'static str) -> Result<()> {
    let end = offset
        .checked_add(u64::try_from(len).map_err(|_| {
            LssError::Format(format!("{what} length does not fit in u64"))
        })?)
        .ok_or_else(|| LssError::Format(format!("{what} range overflows u64")))?;
    if end > file_len {
        return Err(LssError::Format(format!(
            "{what} out of bounds: offset={offset} len={len} file_len={file_len}"
        )));
    }
    Ok(())
}

/// Granularity direct-I/O transfers are aligned to: offset, length,
/// and buffer address.
const DIRECT_IO_GRANULE: u64 = 4096;

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Opened with `O_DIRECT` when the filesystem allows it; otherwise
/// falls back to buffered I/O with a warning, which is the only
/// non-fatal error condition the engine surfaces. In direct mode all
/// transfers are bounced through aligned covering ranges, and the
/// physical file length is kept a multiple of the I/O granule so a
/// covering range never crosses end of file.
#[derive(Debug)]
pub struct FileByteDevice {
    file: Arc<File>,
    /// Logical length; the physical length is this rounded up to the
    /// granule in direct mode.
    len: AtomicU64,
    direct: DirectIo,
}

impl FileByteDevice {
    /// Open `path` read-write, preferring direct I/O.
    pub fn open(path: impl AsRef<Path>, create: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut direct_opts = OpenOptions::new();
        direct_opts
            .read(true)
            .write(true)
            .create(create)
            .truncate(create)
            .custom_flags(libc::O_DIRECT);

        let (file, direct) = match direct_opts.open(path) {
            Ok(file) => (file, DirectIo::Direct),
            Err(err) => {
                warn!(
                    target: "lss::file",
                    event = "direct_io_unavailable",
                    path = %path.display(),
                    error = %err,
                    "filesystem refused direct I/O; falling back to buffered access"
                );
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(create)
                    .truncate(create)
                    .open(path)?;
                (file, DirectIo::Buffered)
            }
        };

        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len: AtomicU64::new(len),
            direct,
        })
    }

    #[must_use]
    pub fn direct_io(&self) -> DirectIo {
        self.direct
    }

    fn is_granule_aligned(offset: u64, len: usize, buf_addr: usize) -> bool {
        offset % DIRECT_IO_GRANULE == 0
            && len as u64 % DIRECT_IO_GRANULE == 0
            && buf_addr % DIRECT_IO_GRANULE as usize == 0
    }

    fn covering_range(offset: u64, len: usize) -> (u64, usize) {
        let start = offset - offset % DIRECT_IO_GRANULE;
        let end = (offset + len as u64).div_ceil(DIRECT_IO_GRANULE) * DIRECT_IO_GRANULE;
        (start, usize::try_from(end - start).expect("covering range fits usize"))
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn set_len_bytes(&self, cx: &Cx, len: u64) -> Result<()> {
        cx_checkpoint(cx)?;
        let physical = match self.direct {
            DirectIo::Direct => len.div_ceil(DIRECT_IO_GRANULE) * DIRECT_IO_GRANULE,
            DirectIo::Buffered => len,
        };
        self.file.set_len(physical)?;
        self.len.store(len, Ordering::Release);
        trace!(target: "lss::file", event = "set_len", len, physical);
        Ok(())
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        check_range(offset, buf.len(), self.len_bytes(), "read")?;
        if self.direct == DirectIo::Buffered
            || Self::is_granule_aligned(offset, buf.len(), buf.as_ptr() as usize)
        {
            self.file.read_exact_at(buf, offset)?;
        } else {
            let (start, cover_len) = Self::covering_range(offset, buf.len());
            let mut bounce = AlignedVec::new(cover_len);
            self.file.read_exact_at(bounce.as_mut_slice(), start)?;
            let skip = usize::try_from(offset - start).expect("skip fits usize");
            buf.copy_from_slice(&bounce.as_slice()[skip..skip + buf.len()]);
        }
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        check_range(offset, buf.len(), self.len_bytes(), "write")?;
        if self.direct == DirectIo::Buffered
            || Self::is_granule_aligned(offset, buf.len(), buf.as_ptr() as usize)
        {
            self.file.write_all_at(buf, offset)?;
        } else {
            // Read-modify-write of the covering granules. Callers that
            // need exclusivity at this granularity get it from the
            // conflict resolver above.
            let (start, cover_len) = Self::covering_range(offset, buf.len());
            let mut bounce = AlignedVec::new(cover_len);
            if start != offset || cover_len != buf.len() {
                self.file.read_exact_at(bounce.as_mut_slice(), start)?;
            }
            let skip = usize::try_from(offset - start).expect("skip fits usize");
            bounce.as_mut_slice()[skip..skip + buf.len()].copy_from_slice(buf);
            self.file.write_all_at(bounce.as_slice(), start)?;
        }
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_data()?;
        cx_checkpoint(cx)?;
        Ok(())
    }
}

/// In-memory byte device for tests.
///
/// Handles share the same backing buffer, so a reopened device sees
/// everything previously written, which is what restart tests need.
#[derive(Debug, Clone, Default)]
pub struct MemoryByteDevice {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A second handle onto the same bytes.
    #[must_use]
    pub fn share(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }

    /// Copy out the full contents (for corruption-injection tests).
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Overwrite raw bytes without bounds discipline (tests only).
    pub fn patch(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        assert!(offset + bytes.len() <= data.len());
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn set_len_bytes(&self, cx: &Cx, len: u64) -> Result<()> {
        cx_checkpoint(cx)?;
        let len = usize::try_from(len)
            .map_err(|_| LssError::Format("memory device length does not fit usize".to_owned()))?;
        self.data.lock().resize(len, 0);
        Ok(())
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let data = self.data.lock();
        check_range(offset, buf.len(), data.len() as u64, "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| LssError::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let mut data = self.data.lock();
        check_range(offset, buf.len(), data.len() as u64, "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| LssError::Format("offset does not fit usize".to_owned()))?;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    #[test]
    fn aligned_vec_slice_is_aligned() {
        let buf = AlignedVec::new(8192);
        assert_eq!(buf.as_slice().as_ptr() as usize % DEFAULT_IO_ALIGNMENT, 0);
        assert_eq!(buf.len(), 8192);
    }

    #[test]
    fn memory_device_roundtrip_and_growth() {
        let cx = test_cx();
        let dev = MemoryByteDevice::new();
        dev.set_len_bytes(&cx, 4096).unwrap();

        dev.write_all_at(&cx, 1024, b"hello").unwrap();
        let mut buf = [0_u8; 5];
        dev.read_exact_at(&cx, 1024, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        assert!(dev.write_all_at(&cx, 4094, b"xyz").is_err());
    }

    #[test]
    fn shared_handles_see_each_others_writes() {
        let cx = test_cx();
        let dev = MemoryByteDevice::new();
        dev.set_len_bytes(&cx, 1024).unwrap();
        dev.write_all_at(&cx, 0, b"abc").unwrap();

        let other = dev.share();
        let mut buf = [0_u8; 3];
        other.read_exact_at(&cx, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn file_device_roundtrip() {
        let cx = test_cx();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.lss");

        let dev = FileByteDevice::open(&path, true).unwrap();
        dev.set_len_bytes(&cx, 8192).unwrap();

        let mut out = AlignedVec::new(4096);
        out.as_mut_slice()[..4].copy_from_slice(b"data");
        dev.write_all_at(&cx, 4096, out.as_slice()).unwrap();
        dev.sync(&cx).unwrap();

        let mut back = AlignedVec::new(4096);
        dev.read_exact_at(&cx, 4096, back.as_mut_slice()).unwrap();
        assert_eq!(&back.as_slice()[..4], b"data");
    }

    #[test]
    fn file_device_read_past_end_is_an_error() {
        let cx = test_cx();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.lss");

        let dev = FileByteDevice::open(&path, true).unwrap();
        dev.set_len_bytes(&cx, 1024).unwrap();
        let mut buf = [0_u8; 8];
        assert!(dev.read_exact_at(&cx, 1020, &mut buf).is_err());
    }
}
