//! Owned handle over a mapped session region
//!
//! `SharedRegion` is the only type that touches the raw mapping. Everything
//! else reaches the control block, the baseline and the record slots through
//! its accessors, which keep slot indices inside the data area no matter what
//! an untrusted producer wrote into the shared indices.

use crate::baseline::fresh_seed;
use crate::discovery::{SessionInfo, metadata_path, remove_metadata, segment_path, write_metadata};
use crate::error::{PipelineError, PipelineResult};
use crate::platform::{
    anonymous_mmap, create_region_mmap, get_current_pid, is_process_alive, map_region_file,
    open_region_file,
};
use cfa_common::shm::consts::DIGEST_SIZE;
use cfa_common::shm::layout::{
    BASELINE_OFFSET, CONTROL_OFFSET, ControlFlowRecord, HashBaseline, RECORDS_OFFSET, RegionState,
    RingBufferControl, region_size, validate_capacity,
};
use memmap2::MmapMut;
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU32;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often `attach` re-checks a region whose creator is still initialising.
const ATTACH_RETRY_INTERVAL: Duration = Duration::from_millis(5);
/// Attach gives up after this many re-checks (about one second).
const ATTACH_RETRIES: u32 = 200;
/// Create/attach rounds in `open` before giving up on a racing peer.
const OPEN_ATTEMPTS: u32 = 3;

#[derive(Debug)]
enum Backing {
    Anonymous,
    Session {
        name: String,
        path: PathBuf,
        creator: bool,
    },
}

/// Mapped `[RingBufferControl][HashBaseline][ControlFlowRecord × capacity]`.
pub struct SharedRegion {
    // Keeps the mapping alive; all access goes through `base`.
    _mmap: MmapMut,
    base: NonNull<u8>,
    capacity: u32,
    backing: Backing,
}

// SAFETY: the mapping is never remapped or resized while the handle lives.
// Shared fields are atomics; record slots and the baseline digest are only
// touched through raw volatile accesses under the ring and baseline locks.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("capacity", &self.capacity)
            .field("backing", &self.backing)
            .field("state", &self.state())
            .finish()
    }
}

fn validate_name(name: &str) -> PipelineResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(PipelineError::BadParameters {
            reason: format!("invalid session name '{name}'"),
        });
    }
    Ok(())
}

impl SharedRegion {
    /// Create session `name` with `capacity` slots, or attach if it exists.
    ///
    /// Whoever wins the exclusive create is the creator and initialises the
    /// region; everyone else attaches and never reinitialises. A region left
    /// behind by a creator that has since died is removed and recreated.
    pub fn open(name: &str, capacity: u32) -> PipelineResult<Self> {
        validate_name(name)?;
        validate_capacity(capacity)?;
        let path = segment_path(name);

        for _ in 0..OPEN_ATTEMPTS {
            if let Some(mmap) = create_region_mmap(&path, region_size(capacity))? {
                let backing = Backing::Session {
                    name: name.to_string(),
                    path: path.clone(),
                    creator: true,
                };
                return Self::initialise(mmap, capacity, backing);
            }

            match Self::attach(name) {
                Ok(region) if is_process_alive(region.creator_pid()) => {
                    if region.capacity() != capacity {
                        debug!(
                            session = name,
                            requested = capacity,
                            actual = region.capacity(),
                            "attached with creator's capacity"
                        );
                    }
                    return Ok(region);
                }
                Ok(region) => {
                    warn!(
                        session = name,
                        creator_pid = region.creator_pid(),
                        "removing session left by dead creator"
                    );
                    drop(region);
                    let _ = std::fs::remove_file(&path);
                    remove_metadata(name);
                }
                // Creator unlinked between our create and attach; race again.
                Err(PipelineError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Err(PipelineError::ResourceExhausted {
            reason: format!("could not create or attach session '{name}'"),
        })
    }

    /// Attach to an existing session without initialising anything.
    ///
    /// Waits (bounded) for the creator to publish `INITIALIZED`, then
    /// validates magic, layout version and capacity against the file length.
    pub fn attach(name: &str) -> PipelineResult<Self> {
        validate_name(name)?;
        let path = segment_path(name);

        for _ in 0..=ATTACH_RETRIES {
            let (file, len) = open_region_file(&path, name)?;
            let len = usize::try_from(len).map_err(|_| PipelineError::LayoutMismatch {
                reason: format!("region file of {len} bytes"),
            })?;

            // The creator sizes the file before writing the header.
            if len >= RECORDS_OFFSET {
                let mut mmap = map_region_file(&file, len)?;
                let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
                    PipelineError::ResourceExhausted {
                        reason: "null mapping".to_string(),
                    }
                })?;
                // SAFETY: the mapping is at least RECORDS_OFFSET bytes and
                // page-aligned.
                let control =
                    unsafe { &*(base.as_ptr().add(CONTROL_OFFSET) as *const RingBufferControl) };

                if control.state().contains(RegionState::INITIALIZED) {
                    let capacity = control.validate(len)?;
                    debug!(session = name, capacity, "attached to session region");
                    return Ok(Self {
                        _mmap: mmap,
                        base,
                        capacity,
                        backing: Backing::Session {
                            name: name.to_string(),
                            path,
                            creator: false,
                        },
                    });
                }
            }

            std::thread::sleep(ATTACH_RETRY_INTERVAL);
        }

        Err(PipelineError::NotInitialized {
            name: name.to_string(),
        })
    }

    /// Private anonymous region with the same layout, for in-process
    /// pipelines. This handle is always the creator.
    pub fn anonymous(capacity: u32) -> PipelineResult<Self> {
        validate_capacity(capacity)?;
        let mmap = anonymous_mmap(region_size(capacity))?;
        Self::initialise(mmap, capacity, Backing::Anonymous)
    }

    fn initialise(mut mmap: MmapMut, capacity: u32, backing: Backing) -> PipelineResult<Self> {
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            PipelineError::ResourceExhausted {
                reason: "null mapping".to_string(),
            }
        })?;
        // Built before seeding so Drop unlinks the file if seeding fails.
        let region = Self {
            _mmap: mmap,
            base,
            capacity,
            backing,
        };

        let seed = fresh_seed()?;
        let pid = get_current_pid();

        // SAFETY: the mapping is zero-filled, large enough for the layout and
        // nobody treats it as initialised before INITIALIZED is published.
        unsafe {
            (*(base.as_ptr().add(CONTROL_OFFSET) as *mut RingBufferControl)).init(capacity, pid);
            (*(base.as_ptr().add(BASELINE_OFFSET) as *mut HashBaseline)).init(seed);
        }

        if let Backing::Session { name, .. } = &region.backing {
            write_metadata(&SessionInfo::new(name, capacity, pid, 1))?;
        }

        region.control().insert_state(RegionState::INITIALIZED);
        info!(capacity, creator_pid = pid, session = ?region.name(), "session region initialised");
        Ok(region)
    }

    /// Ring control block.
    #[inline]
    pub fn control(&self) -> &RingBufferControl {
        // SAFETY: initialised before the handle is handed out; mutable fields
        // are atomics.
        unsafe { &*(self.base.as_ptr().add(CONTROL_OFFSET) as *const RingBufferControl) }
    }

    #[inline]
    fn baseline_ptr(&self) -> *mut HashBaseline {
        // SAFETY: BASELINE_OFFSET is inside the mapping.
        unsafe { self.base.as_ptr().add(BASELINE_OFFSET) as *mut HashBaseline }
    }

    /// Baseline generation counter.
    #[inline]
    pub fn baseline_generation(&self) -> &AtomicU32 {
        // SAFETY: field of an initialised block; atomics tolerate sharing.
        unsafe { &(*self.baseline_ptr()).generation }
    }

    /// Baseline lock word.
    #[inline]
    pub fn baseline_lock_word(&self) -> &AtomicU32 {
        // SAFETY: as above.
        unsafe { &(*self.baseline_ptr()).locked }
    }

    /// Read the genesis digest. Callers hold the baseline lock.
    pub(crate) fn read_initial_digest(&self) -> [u8; DIGEST_SIZE] {
        // SAFETY: in-bounds, aligned field; no reference is created.
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.baseline_ptr()).initial_digest)) }
    }

    /// Replace the genesis digest. Callers hold the baseline lock.
    pub(crate) fn write_initial_digest(&self, digest: [u8; DIGEST_SIZE]) {
        // SAFETY: as above.
        unsafe {
            ptr::write_volatile(
                ptr::addr_of_mut!((*self.baseline_ptr()).initial_digest),
                digest,
            )
        }
    }

    /// Raw pointer to slot `index % capacity`.
    ///
    /// The pointer is always inside the data area. Dereferencing it races
    /// with other participants unless the ring protocol is followed.
    #[inline]
    pub fn slot_ptr(&self, index: u32) -> *mut ControlFlowRecord {
        let index = (index % self.capacity) as usize;
        // SAFETY: index < capacity, so the offset stays inside the mapping.
        unsafe {
            (self.base.as_ptr().add(RECORDS_OFFSET) as *mut ControlFlowRecord).add(index)
        }
    }

    /// Copy slot `index` out of the mapping.
    #[inline]
    pub fn read_slot(&self, index: u32) -> ControlFlowRecord {
        // SAFETY: slot_ptr is in bounds and 8-byte aligned.
        unsafe { ptr::read_volatile(self.slot_ptr(index)) }
    }

    #[inline]
    pub(crate) fn write_slot(&self, index: u32, record: &ControlFlowRecord) {
        // SAFETY: as above; callers own the slot under the ring lock.
        unsafe { ptr::write_volatile(self.slot_ptr(index), *record) }
    }

    #[inline]
    pub(crate) fn write_digest(&self, index: u32, digest: &[u8; DIGEST_SIZE]) {
        // SAFETY: as above; only the trusted consumer writes digests.
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.slot_ptr(index)).digest), *digest) }
    }

    /// Number of record slots.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current state flags.
    #[inline]
    pub fn state(&self) -> RegionState {
        self.control().state()
    }

    /// Process that created the region.
    #[inline]
    pub fn creator_pid(&self) -> u32 {
        self.control().creator_pid
    }

    /// Session name, `None` for anonymous regions.
    pub fn name(&self) -> Option<&str> {
        match &self.backing {
            Backing::Session { name, .. } => Some(name),
            Backing::Anonymous => None,
        }
    }

    /// True if this handle initialised the region.
    pub fn is_creator(&self) -> bool {
        match &self.backing {
            Backing::Session { creator, .. } => *creator,
            Backing::Anonymous => true,
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // Unlink only; processes still attached keep their mapping.
        if let Backing::Session {
            name,
            path,
            creator: true,
        } = &self.backing
        {
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(metadata_path(name));
            debug!(session = %name, "session region unlinked");
        }
    }
}
