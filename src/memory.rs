//! Guarded allocation tracker
//!
//! A diagnostic overlay over the system allocator. Every tracked block is
//! laid out as:
//!
//! ```text
//! | BlockHeader | guard words | payload | guard words |
//! ```
//!
//! Each guard word stores the address of the owning header; a deallocation
//! re-verifies every guard word, the header signature, and the allocation
//! kind before releasing anything. Any mismatch means the caller has already
//! corrupted memory, so the tracker reports a fatal [`MemoryError`] instead
//! of attempting to heal.
//!
//! Live blocks are registered in a map keyed by header address; whatever
//! survives to shutdown is rendered as a leak report, with the call context
//! captured at allocation time as a pseudo stack trace.
//!
//! This is a debug/diagnostic facility, not a general-purpose allocator
//! replacement.

use crate::context::{self, ContextToken};
use crate::error::{GuardRegion, MemoryError};
use crate::lock;
use crate::profiler::Profiler;
use crate::scope;
use fnv::FnvHashMap;
use std::alloc::{alloc, alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

/// Known constant stamped into every header; a mismatch at deallocation
/// means the header was clobbered or the pointer was never ours.
const ALLOC_SIGNATURE: usize = 0x80ff_80ff;

const WORD: usize = mem::size_of::<usize>();

/// Allocation discipline of a block. Allocation and deallocation must use
/// the same kind; mixing them is reported as corruption of the call site's
/// memory discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AllocKind {
    New,
    NewArray,
    RawAlloc,
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocKind::New => write!(f, "new"),
            AllocKind::NewArray => write!(f, "new-array"),
            AllocKind::RawAlloc => write!(f, "raw-alloc"),
        }
    }
}

/// Source location of an allocation or deallocation call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocSite {
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
}

impl fmt::Display for AllocSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) in '{}'", self.file, self.line, self.function)
    }
}

/// The current source location, for the tracker's `site` parameters.
#[macro_export]
macro_rules! alloc_site {
    () => {
        $crate::memory::AllocSite {
            file: file!(),
            line: line!(),
            function: $crate::function_path!(),
        }
    };
}

/// Header preceding every tracked payload.
#[repr(C)]
struct BlockHeader {
    signature: usize,
    /// Payload size after word-alignment rounding.
    size: usize,
    kind: AllocKind,
    /// Monotonic id; orders the leak report deterministically.
    seq: u64,
    site: AllocSite,
    /// Call context active when the block was allocated.
    context: Option<ContextToken>,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();
const HEADER_ALIGN: usize = mem::align_of::<BlockHeader>();

fn round_up_to_word(size: usize) -> usize {
    (size + WORD - 1) & !(WORD - 1)
}

/// Tracker for guarded allocations.
///
/// A process normally uses the [`global()`] instance so byte counts land on
/// the profiler's current call context, but independent instances work the
/// same way and are what the tests use.
pub struct MemoryTracker {
    guard_words: usize,
    next_seq: AtomicU64,
    live: Mutex<FnvHashMap<usize, u64>>,
}

/// The process-wide tracker, sized from the global profiler's configuration.
pub fn global() -> &'static MemoryTracker {
    static GLOBAL: OnceLock<MemoryTracker> = OnceLock::new();
    GLOBAL.get_or_init(|| MemoryTracker::new(Profiler::global().config().guard_words))
}

impl MemoryTracker {
    pub fn new(guard_words: usize) -> Self {
        assert!(guard_words >= 1, "at least one guard word is required");
        MemoryTracker {
            guard_words,
            next_seq: AtomicU64::new(1),
            live: Mutex::new(FnvHashMap::default()),
        }
    }

    fn guard_bytes(&self) -> usize {
        self.guard_words * WORD
    }

    /// Offset from the header to the payload.
    fn payload_offset(&self) -> usize {
        HEADER_SIZE + self.guard_bytes()
    }

    fn layout(&self, payload_size: usize) -> Layout {
        let total = self
            .payload_offset()
            .checked_add(payload_size)
            .and_then(|n| n.checked_add(self.guard_bytes()))
            .expect("allocation size overflow");
        Layout::from_size_align(total, HEADER_ALIGN).expect("allocation size overflow")
    }

    /// Allocate a guarded block and return the payload address.
    ///
    /// The requested size is rounded up to the platform word size; the
    /// rounded size is what gets charged to the current call context and
    /// what [`deallocate`](Self::deallocate) later credits back. Underlying
    /// allocation failure aborts via the standard out-of-memory path.
    pub fn allocate(&self, kind: AllocKind, size: usize, site: AllocSite) -> *mut u8 {
        self.allocate_inner(kind, size, site, false)
    }

    /// Like [`allocate`](Self::allocate) but with zero-initialized payload.
    pub fn allocate_zeroed(&self, kind: AllocKind, size: usize, site: AllocSite) -> *mut u8 {
        self.allocate_inner(kind, size, site, true)
    }

    fn allocate_inner(&self, kind: AllocKind, size: usize, site: AllocSite, zeroed: bool) -> *mut u8 {
        let size = round_up_to_word(size);
        let layout = self.layout(size);
        let raw = unsafe {
            if zeroed {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        if raw.is_null() {
            handle_alloc_error(layout);
        }

        let context = scope::charge_allocation(size as u64);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let header = raw.cast::<BlockHeader>();
        // SAFETY: `raw` is a fresh allocation large enough for the header,
        // both guard regions, and the payload, aligned for BlockHeader.
        unsafe {
            ptr::write(
                header,
                BlockHeader {
                    signature: ALLOC_SIGNATURE,
                    size,
                    kind,
                    seq,
                    site,
                    context,
                },
            );
            let mut word = raw.add(HEADER_SIZE).cast::<usize>();
            for _ in 0..self.guard_words {
                ptr::write(word, header as usize);
                word = word.add(1);
            }
            let mut word = raw.add(self.payload_offset() + size).cast::<usize>();
            for _ in 0..self.guard_words {
                ptr::write(word, header as usize);
                word = word.add(1);
            }
        }

        lock(&self.live).insert(header as usize, seq);
        // SAFETY: payload offset is within the allocation.
        unsafe { raw.add(self.payload_offset()) }
    }

    /// Verify and release a guarded block, returning the charged size.
    ///
    /// Verification order: header signature, both guard regions, allocation
    /// kind. On any mismatch the block stays registered (and will appear in
    /// the leak report) because its metadata can no longer be trusted.
    /// A null pointer is a no-op, mirroring `free(NULL)`.
    pub fn deallocate(&self, kind: AllocKind, payload: *mut u8) -> Result<usize, MemoryError> {
        if payload.is_null() {
            return Ok(0);
        }
        let Some(header_addr) = (payload as usize).checked_sub(self.payload_offset()) else {
            return Err(MemoryError::SignatureMismatch {
                address: payload as usize,
            });
        };
        let header = header_addr as *mut BlockHeader;

        // SAFETY: the arithmetic above recovers the header of a block this
        // tracker allocated; every field read is re-validated before the
        // block is trusted, starting with the signature.
        unsafe {
            if (*header).signature != ALLOC_SIGNATURE {
                warn!(address = header_addr, "signature mismatch at deallocation");
                return Err(MemoryError::SignatureMismatch {
                    address: payload as usize,
                });
            }
            let site = (*header).site;
            let size = (*header).size;

            let mut word = (header_addr as *const u8).add(HEADER_SIZE).cast::<usize>();
            for index in 0..self.guard_words {
                if ptr::read(word) != header_addr {
                    warn!(%site, index, "pre-payload guard word clobbered");
                    return Err(MemoryError::GuardClobbered {
                        region: GuardRegion::Before,
                        index,
                        site,
                    });
                }
                word = word.add(1);
            }
            let mut word = payload.add(size).cast::<usize>();
            for index in 0..self.guard_words {
                if ptr::read(word) != header_addr {
                    warn!(%site, index, "post-payload guard word clobbered");
                    return Err(MemoryError::GuardClobbered {
                        region: GuardRegion::After,
                        index,
                        site,
                    });
                }
                word = word.add(1);
            }

            let allocated_kind = (*header).kind;
            if allocated_kind != kind {
                warn!(%site, %allocated_kind, freed = %kind, "allocation kind mismatch");
                return Err(MemoryError::KindMismatch {
                    allocated: allocated_kind,
                    freed: kind,
                    site,
                });
            }

            if lock(&self.live).remove(&header_addr).is_none() {
                return Err(MemoryError::UnknownBlock {
                    address: payload as usize,
                });
            }
            scope::charge_deallocation(size as u64);

            // Take ownership of the captured context so its refcount drops,
            // then release the whole block.
            let context = ptr::read(ptr::addr_of!((*header).context));
            drop(context);
            dealloc(header.cast::<u8>(), self.layout(size));
            Ok(size)
        }
    }

    /// Resize a block, preserving the leading `min(old, new)` payload bytes.
    ///
    /// Implemented as allocate-copy-free so the new block gets fresh guards
    /// and a fresh creation site. A null pointer behaves like a plain
    /// allocation.
    pub fn reallocate(
        &self,
        kind: AllocKind,
        payload: *mut u8,
        new_size: usize,
        site: AllocSite,
    ) -> Result<*mut u8, MemoryError> {
        if payload.is_null() {
            return Ok(self.allocate(kind, new_size, site));
        }
        let Some(header_addr) = (payload as usize).checked_sub(self.payload_offset()) else {
            return Err(MemoryError::SignatureMismatch {
                address: payload as usize,
            });
        };
        let header = header_addr as *const BlockHeader;
        // SAFETY: signature is validated before the size field is trusted.
        let old_size = unsafe {
            if (*header).signature != ALLOC_SIGNATURE {
                return Err(MemoryError::SignatureMismatch {
                    address: payload as usize,
                });
            }
            (*header).size
        };
        let fresh = self.allocate(kind, new_size, site);
        // SAFETY: both payload regions are live and do not overlap; the copy
        // length is bounded by both block sizes.
        unsafe {
            ptr::copy_nonoverlapping(payload, fresh, old_size.min(round_up_to_word(new_size)));
        }
        self.deallocate(kind, payload)?;
        Ok(fresh)
    }

    /// Duplicate a byte slice into a fresh guarded `RawAlloc` block.
    pub fn duplicate_bytes(&self, bytes: &[u8], site: AllocSite) -> *mut u8 {
        let payload = self.allocate(AllocKind::RawAlloc, bytes.len(), site);
        // SAFETY: the new payload is at least `bytes.len()` long.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), payload, bytes.len());
        }
        payload
    }

    /// Duplicate a string with a trailing NUL, strdup-style.
    pub fn duplicate_str(&self, s: &str, site: AllocSite) -> *mut u8 {
        let payload = self.allocate(AllocKind::RawAlloc, s.len() + 1, site);
        // SAFETY: the payload holds at least `s.len() + 1` bytes.
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), payload, s.len());
            ptr::write(payload.add(s.len()), 0);
        }
        payload
    }

    /// Number of blocks currently live.
    pub fn live_blocks(&self) -> usize {
        lock(&self.live).len()
    }

    /// Render the leak report: one entry per surviving block, in allocation
    /// order, or an explicit no-leak line when the registry is empty.
    pub fn write_leak_report<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let live = lock(&self.live);
        if live.is_empty() {
            writeln!(w, "No memory leaks detected.")?;
            return Ok(());
        }

        let mut entries: Vec<(u64, usize)> = live.iter().map(|(&addr, &seq)| (seq, addr)).collect();
        entries.sort_unstable();
        writeln!(w, "Detected {} leaked allocation(s).", entries.len())?;
        writeln!(w, "-------------------")?;
        for (_, addr) in entries {
            let header = addr as *const BlockHeader;
            // SAFETY: the registry lock is held, so every registered block
            // is still live and its header intact (deallocation removes the
            // entry before releasing memory).
            unsafe {
                if let Some(token) = &(*header).context {
                    writeln!(w, "Call context trace:")?;
                    context::write_context_trace(w, token)?;
                }
                writeln!(
                    w,
                    "{}\nsize {}, allocated as {}",
                    (*header).site,
                    (*header).size,
                    (*header).kind
                )?;
            }
            writeln!(w, "-------------------")?;
        }
        Ok(())
    }
}

impl Drop for MemoryTracker {
    /// Release whatever is still registered. The leak report, if wanted,
    /// must be written before the tracker is dropped.
    fn drop(&mut self) {
        let live = mem::take(&mut *lock(&self.live));
        if !live.is_empty() {
            debug!(blocks = live.len(), "releasing unreclaimed blocks");
        }
        for (&addr, _) in live.iter() {
            let header = addr as *mut BlockHeader;
            // SAFETY: registered blocks are live and owned by this tracker.
            unsafe {
                let size = (*header).size;
                let context = ptr::read(ptr::addr_of!((*header).context));
                drop(context);
                dealloc(header.cast::<u8>(), self.layout(size));
            }
        }
    }
}

impl fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTracker")
            .field("guard_words", &self.guard_words)
            .field("live_blocks", &self.live_blocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> AllocSite {
        alloc_site!()
    }

    #[test]
    fn test_allocate_write_deallocate_roundtrip() {
        let tracker = MemoryTracker::new(4);
        let payload = tracker.allocate(AllocKind::RawAlloc, 64, site());
        unsafe {
            for i in 0..64 {
                ptr::write(payload.add(i), i as u8);
            }
            assert_eq!(ptr::read(payload.add(63)), 63);
        }
        let freed = tracker.deallocate(AllocKind::RawAlloc, payload).unwrap();
        assert_eq!(freed, 64);
        assert_eq!(tracker.live_blocks(), 0);
    }

    #[test]
    fn test_size_rounds_up_to_word() {
        let tracker = MemoryTracker::new(1);
        let payload = tracker.allocate(AllocKind::New, 3, site());
        let freed = tracker.deallocate(AllocKind::New, payload).unwrap();
        assert_eq!(freed, WORD);
    }

    #[test]
    fn test_overrun_detected() {
        let tracker = MemoryTracker::new(2);
        let payload = tracker.allocate(AllocKind::RawAlloc, 16, site());
        unsafe {
            // One byte past the payload lands in the first post-payload
            // guard word.
            ptr::write(payload.add(16), 0xAB);
        }
        let err = tracker.deallocate(AllocKind::RawAlloc, payload).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::GuardClobbered {
                region: GuardRegion::After,
                ..
            }
        ));
        // The corrupt block stays registered.
        assert_eq!(tracker.live_blocks(), 1);
    }

    #[test]
    fn test_underrun_detected() {
        let tracker = MemoryTracker::new(2);
        let payload = tracker.allocate(AllocKind::RawAlloc, 16, site());
        unsafe {
            ptr::write(payload.sub(1), 0xCD);
        }
        let err = tracker.deallocate(AllocKind::RawAlloc, payload).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::GuardClobbered {
                region: GuardRegion::Before,
                ..
            }
        ));
    }

    #[test]
    fn test_kind_mismatch_detected() {
        let tracker = MemoryTracker::new(1);
        let payload = tracker.allocate(AllocKind::New, 32, site());
        let err = tracker.deallocate(AllocKind::RawAlloc, payload).unwrap_err();
        match err {
            MemoryError::KindMismatch { allocated, freed, .. } => {
                assert_eq!(allocated, AllocKind::New);
                assert_eq!(freed, AllocKind::RawAlloc);
            }
            other => panic!("expected kind mismatch, got {other}"),
        }
        // Clean up with the right kind.
        tracker.deallocate(AllocKind::New, payload).unwrap();
    }

    #[test]
    fn test_null_deallocate_is_noop() {
        let tracker = MemoryTracker::new(1);
        assert_eq!(tracker.deallocate(AllocKind::RawAlloc, ptr::null_mut()).unwrap(), 0);
    }

    #[test]
    fn test_leak_report_lists_surviving_blocks() {
        let tracker = MemoryTracker::new(1);
        let keep = tracker.allocate(AllocKind::RawAlloc, 48, site());
        let free = tracker.allocate(AllocKind::RawAlloc, 24, site());
        tracker.deallocate(AllocKind::RawAlloc, free).unwrap();

        let mut buf = Vec::new();
        tracker.write_leak_report(&mut buf).unwrap();
        let report = String::from_utf8(buf).unwrap();
        assert!(report.contains("Detected 1 leaked allocation(s)."));
        assert!(report.contains("size 48"));
        assert!(report.contains("memory.rs"));
        assert!(report.contains("raw-alloc"));

        tracker.deallocate(AllocKind::RawAlloc, keep).unwrap();
    }

    #[test]
    fn test_empty_leak_report_is_explicit() {
        let tracker = MemoryTracker::new(1);
        let mut buf = Vec::new();
        tracker.write_leak_report(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "No memory leaks detected.\n");
    }

    #[test]
    fn test_reallocate_preserves_contents() {
        let tracker = MemoryTracker::new(2);
        let payload = tracker.allocate(AllocKind::RawAlloc, 8, site());
        unsafe {
            for i in 0..8 {
                ptr::write(payload.add(i), i as u8 + 1);
            }
        }
        let grown = tracker
            .reallocate(AllocKind::RawAlloc, payload, 32, site())
            .unwrap();
        unsafe {
            for i in 0..8 {
                assert_eq!(ptr::read(grown.add(i)), i as u8 + 1);
            }
        }
        assert_eq!(tracker.live_blocks(), 1);
        tracker.deallocate(AllocKind::RawAlloc, grown).unwrap();
    }

    #[test]
    fn test_duplicate_str_is_nul_terminated() {
        let tracker = MemoryTracker::new(1);
        let payload = tracker.duplicate_str("hello", site());
        unsafe {
            assert_eq!(std::slice::from_raw_parts(payload, 5), b"hello");
            assert_eq!(ptr::read(payload.add(5)), 0);
        }
        tracker.deallocate(AllocKind::RawAlloc, payload).unwrap();
    }

    #[test]
    fn test_zeroed_allocation() {
        let tracker = MemoryTracker::new(1);
        let payload = tracker.allocate_zeroed(AllocKind::RawAlloc, 40, site());
        unsafe {
            assert!(std::slice::from_raw_parts(payload, 40).iter().all(|&b| b == 0));
        }
        tracker.deallocate(AllocKind::RawAlloc, payload).unwrap();
    }

    #[test]
    fn test_drop_releases_leaked_blocks() {
        // No assertion beyond "does not crash": the tracker must reclaim
        // registered blocks it still owns.
        let tracker = MemoryTracker::new(1);
        let _leak = tracker.allocate(AllocKind::New, 128, site());
        drop(tracker);
    }
}
