//! Instance directory.
//!
//! Holds the process-wide base instance, the set of live user-created
//! instances, and each thread's active instance. Only create, destroy, init
//! and shutdown take the directory lock; allocation never does. The base
//! pointer is read lock-free, and the active instance is thread-local so one
//! thread switching arenas never redirects another thread's allocations.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::api::alloc::Arena;
use crate::api::config::ArenaConfig;
use crate::api::error::ArenaError;
use crate::core::instance::InstanceBlock;
use crate::diagnostics::events::{self, ArenaEvent};
use crate::sync::atomics::AtomicCounter;
use crate::sync::mutex::Mutex;

/// Most user-created instances alive at once (the base is not counted).
pub const MAX_INSTANCES: usize = 64;

/// Region ids, shared by every instance.
pub(crate) static NEXT_REGION_ID: AtomicCounter = AtomicCounter::new(0);

/// Instance ids, shared by the base and user-created instances.
pub(crate) static NEXT_INSTANCE_ID: AtomicCounter = AtomicCounter::new(0);

static BASE: AtomicPtr<InstanceBlock> = AtomicPtr::new(ptr::null_mut());

static DIRECTORY: Mutex<Directory> = Mutex::new(Directory::new());

thread_local! {
    static ACTIVE: Cell<Option<Arena>> = const { Cell::new(None) };
}

struct Directory {
    live: [Option<NonNull<InstanceBlock>>; MAX_INSTANCES],
}

// SAFETY: the pointers name instances that are themselves Send + Sync.
unsafe impl Send for Directory {}

impl Directory {
    const fn new() -> Self {
        Self {
            live: [None; MAX_INSTANCES],
        }
    }

    fn contains(&self, block: NonNull<InstanceBlock>) -> bool {
        self.live.iter().any(|slot| *slot == Some(block))
    }
}

fn base_block() -> Option<NonNull<InstanceBlock>> {
    NonNull::new(BASE.load(Ordering::Acquire))
}

/// Create the base instance with `config`.
///
/// Returns the existing base unchanged if one is already up.
pub fn init(config: &ArenaConfig) -> Result<Arena, ArenaError> {
    let created = {
        let _directory = DIRECTORY.lock();
        if let Some(base) = base_block() {
            return Ok(Arena::from_block(base));
        }
        let block = InstanceBlock::create(config, NEXT_INSTANCE_ID.next(), true)?;
        BASE.store(block.as_ptr(), Ordering::Release);
        Arena::from_block(block)
    };

    events::record(ArenaEvent::InstanceCreated {
        instance: created.id(),
        regions: created.region_count(),
    });
    Ok(created)
}

/// The base instance, if initialized.
pub fn base() -> Option<Arena> {
    base_block().map(Arena::from_block)
}

/// The base instance, creating it with the default config on first use.
///
/// This is the path taken by the allocation hooks, so the default config is
/// used as-is: reading the environment here would allocate.
pub(crate) fn base_or_init() -> Option<Arena> {
    base().or_else(|| init(&ArenaConfig::default()).ok())
}

/// Create an independent instance.
///
/// Its first region is a separate mapping, so unlike the base it can shrink
/// all the way down to one region of any age.
pub fn create_instance(config: &ArenaConfig) -> Result<Arena, ArenaError> {
    let created = {
        let mut directory = DIRECTORY.lock();
        match directory.live.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                let block = InstanceBlock::create(config, NEXT_INSTANCE_ID.next(), false)?;
                *slot = Some(block);
                Ok(Arena::from_block(block))
            }
            None => Err(ArenaError::InstanceLimit {
                limit: MAX_INSTANCES,
            }),
        }
    };

    match created {
        Ok(arena) => {
            events::record(ArenaEvent::InstanceCreated {
                instance: arena.id(),
                regions: arena.region_count(),
            });
            Ok(arena)
        }
        Err(err) => {
            crate::ta_emit!(TA104);
            Err(err)
        }
    }
}

/// Tear down an instance and unmap all of its regions.
///
/// Fails for the base instance, for the calling thread's active instance,
/// and for handles that do not name a live instance.
///
/// # Safety
///
/// Nothing allocated from the instance may be used afterwards, no copy of
/// `arena` may be used afterwards, and no other thread may have it active.
pub unsafe fn destroy_instance(arena: Arena) -> Result<(), ArenaError> {
    if base() == Some(arena) {
        crate::ta_emit!(TA102);
        return Err(ArenaError::BaseInstance);
    }
    if ACTIVE.try_with(Cell::get).ok().flatten() == Some(arena) {
        crate::ta_emit!(TA101);
        return Err(ArenaError::ActiveInstance);
    }

    let destroyed = {
        let mut directory = DIRECTORY.lock();
        match directory.live.iter_mut().find(|slot| **slot == Some(arena.block())) {
            Some(slot) => {
                *slot = None;
                let id = arena.id();
                InstanceBlock::destroy(arena.block());
                Some(id)
            }
            None => None,
        }
    };

    match destroyed {
        Some(instance) => {
            events::record(ArenaEvent::InstanceDestroyed { instance });
            Ok(())
        }
        None => {
            crate::ta_emit!(TA103);
            Err(ArenaError::UnknownInstance)
        }
    }
}

/// Destroy every instance, the base last, and forget the calling thread's
/// active instance. The next hook call re-initializes a fresh base.
///
/// # Safety
///
/// No memory from any instance may be used afterwards, and no other thread
/// may be allocating or hold an arena handle.
pub unsafe fn shutdown() {
    let mut destroyed = [None::<u64>; MAX_INSTANCES + 1];
    {
        let mut directory = DIRECTORY.lock();
        for (slot, out) in directory.live.iter_mut().zip(destroyed.iter_mut()) {
            if let Some(block) = slot.take() {
                *out = Some(block.as_ref().id());
                InstanceBlock::destroy(block);
            }
        }
        if let Some(base) = NonNull::new(BASE.swap(ptr::null_mut(), Ordering::AcqRel)) {
            destroyed[MAX_INSTANCES] = Some(base.as_ref().id());
            InstanceBlock::destroy(base);
        }
    }
    let _ = ACTIVE.try_with(|active| active.set(None));

    for instance in destroyed.into_iter().flatten() {
        events::record(ArenaEvent::InstanceDestroyed { instance });
    }
}

/// The calling thread's active instance; the base unless switched.
pub fn active() -> Option<Arena> {
    ACTIVE.try_with(Cell::get).ok().flatten().or_else(base)
}

/// Route the calling thread's hook allocations to `arena`.
///
/// Returns the previously active instance. Memory already allocated from
/// other instances is unaffected.
pub fn set_active(arena: Arena) -> Result<Option<Arena>, ArenaError> {
    let known = base() == Some(arena) || DIRECTORY.lock().contains(arena.block());
    if !known {
        crate::ta_emit!(TA103);
        return Err(ArenaError::UnknownInstance);
    }
    let previous = active();
    let _ = ACTIVE.try_with(|active| active.set(Some(arena)));
    Ok(previous)
}

/// Make the base the calling thread's active instance again.
///
/// Returns the instance that was active before.
pub fn rebase_to_base() -> Option<Arena> {
    let previous = active();
    let _ = ACTIVE.try_with(|active| active.set(None));
    previous
}

/// Live user-created instances (excluding the base).
pub fn instance_count() -> usize {
    DIRECTORY.lock().live.iter().flatten().count()
}
