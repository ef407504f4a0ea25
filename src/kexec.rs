//! kexec segments and the loader seam.
//!
//! A boot is handed off as a set of [`Segment`]s (byte buffers destined for
//! fixed physical ranges) plus an entry point. [`KexecLoader`] is the one
//! place that touches the running kernel; [`SyscallLoader`] calls
//! `kexec_load(2)`, [`RecordingLoader`] keeps the handoff for dry runs.

use std::fmt;

use log::{debug, info};

use crate::{FitError, Result};

/// Half-open physical address range `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Range {
    pub start: u64,
    pub size: u64,
}

impl Range {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// One past the last address; saturates at `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end()
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.size != 0 && other.size != 0 && self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

/// Bytes to copy into physical memory at `phys`.
///
/// `phys.size` may exceed the buffer length; the remainder is zero filled
/// by the kernel.
#[derive(Clone, PartialEq, Eq)]
pub struct Segment {
    pub buf: Vec<u8>,
    pub phys: Range,
}

impl Segment {
    pub fn new(buf: Vec<u8>, phys: Range) -> Self {
        Self { buf, phys }
    }

    /// Segment whose physical range is exactly the size of `buf`.
    pub fn at(buf: Vec<u8>, start: u64) -> Self {
        let phys = Range::new(start, buf.len() as u64);
        Self { buf, phys }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(virt: {} bytes, phys: {})", self.buf.len(), self.phys)
    }
}

/// Segments ordered by physical start address, never overlapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segments(Vec<Segment>);

impl Segments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `seg`, keeping the list sorted. A segment whose physical range
    /// overlaps one already present is refused.
    pub fn insert(&mut self, seg: Segment) -> Result<()> {
        if let Some(existing) = self.0.iter().find(|s| s.phys.overlaps(&seg.phys)) {
            return Err(FitError::SegmentOverlap {
                new: seg.phys.to_string(),
                existing: existing.phys.to_string(),
            });
        }
        let pos = self.0.partition_point(|s| s.phys.start < seg.phys.start);
        self.0.insert(pos, seg);
        Ok(())
    }

    /// True if any segment's physical range contains `addr`.
    pub fn phys_contains(&self, addr: u64) -> bool {
        self.0.iter().any(|s| s.phys.contains(addr))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Segments {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Hands a prepared boot to the running kernel.
pub trait KexecLoader {
    fn load(&mut self, entry: u64, segments: &Segments, flags: u64) -> Result<()>;
}

fn check_entry(entry: u64, segments: &Segments) -> Result<()> {
    if segments.is_empty() {
        return Err(FitError::LoaderFailure("no segments to load".into()));
    }
    if !segments.phys_contains(entry) {
        return Err(FitError::LoaderFailure(format!(
            "entry point {entry:#x} is not contained by any segment"
        )));
    }
    Ok(())
}

/// One recorded handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadCall {
    pub entry: u64,
    pub segments: Segments,
    pub flags: u64,
}

/// Loader that keeps every handoff instead of performing it.
#[derive(Debug, Default)]
pub struct RecordingLoader {
    pub calls: Vec<LoadCall>,
}

impl RecordingLoader {
    pub fn last(&self) -> Option<&LoadCall> {
        self.calls.last()
    }
}

impl KexecLoader for RecordingLoader {
    fn load(&mut self, entry: u64, segments: &Segments, flags: u64) -> Result<()> {
        check_entry(entry, segments)?;
        info!(
            "dry run: kexec_load(entry={entry:#x}, {} segments, flags={flags:#x})",
            segments.len()
        );
        self.calls.push(LoadCall {
            entry,
            segments: segments.clone(),
            flags,
        });
        Ok(())
    }
}

/// Loader backed by the `kexec_load(2)` system call. Needs `CAP_SYS_BOOT`.
#[derive(Debug, Default)]
pub struct SyscallLoader;

#[cfg(target_os = "linux")]
mod sys {
    use super::*;

    /// `struct kexec_segment` from `<linux/kexec.h>`.
    #[allow(dead_code)]
    #[repr(C)]
    struct KexecSegment {
        buf: *const libc::c_void,
        bufsz: libc::size_t,
        mem: *const libc::c_void,
        memsz: libc::size_t,
    }

    fn page_size() -> u64 {
        // SAFETY: sysconf has no preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as u64
        } else {
            4096
        }
    }

    pub(super) fn kexec_load(entry: u64, segments: &Segments, flags: u64) -> Result<()> {
        let page = page_size();
        let mut raw = Vec::with_capacity(segments.len());
        for seg in segments {
            if seg.phys.start % page != 0 {
                return Err(FitError::LoaderFailure(format!(
                    "segment {} is not page aligned",
                    seg.phys
                )));
            }
            let memsz = seg
                .phys
                .size
                .max(seg.buf.len() as u64)
                .checked_add(page - 1)
                .map(|sz| sz / page * page)
                .ok_or_else(|| FitError::LoaderFailure(format!("segment {} too large", seg.phys)))?;
            raw.push(KexecSegment {
                buf: seg.buf.as_ptr().cast(),
                bufsz: seg.buf.len(),
                mem: seg.phys.start as *const libc::c_void,
                memsz: memsz as libc::size_t,
            });
        }
        debug!("kexec_load: entry={entry:#x} segments={segments:?} flags={flags:#x}");

        // SAFETY: `raw` and every buffer it points into outlive the call; the
        // kernel copies the segments before returning.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_kexec_load,
                entry as libc::c_ulong,
                raw.len() as libc::c_ulong,
                raw.as_ptr(),
                flags as libc::c_ulong,
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            return Err(FitError::LoaderFailure(format!(
                "kexec_load(entry={entry:#x}, segments={segments:?}, flags={flags:#x}): {err}"
            )));
        }
        Ok(())
    }
}

impl KexecLoader for SyscallLoader {
    #[cfg(target_os = "linux")]
    fn load(&mut self, entry: u64, segments: &Segments, flags: u64) -> Result<()> {
        check_entry(entry, segments)?;
        sys::kexec_load(entry, segments, flags)?;
        info!("kexec image loaded, entry {entry:#x}");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn load(&mut self, entry: u64, segments: &Segments, _flags: u64) -> Result<()> {
        check_entry(entry, segments)?;
        Err(FitError::LoaderFailure(
            "kexec_load is only available on Linux".into(),
        ))
    }
}
