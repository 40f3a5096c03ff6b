//! Shared object registry.
//!
//! Every named kernel object (task, semaphore, RW-lock, spinlock, and
//! the IPC channels built on them) shares this one table, keyed by a
//! 6-character name compressed into a u32. Slots carry a usage count so
//! "open by name" pairs with "close by name" across deletion ordering.
//!
//! The table is read-mostly (lookups dominate), so it sits behind an
//! `IrqRwLock`; writers are registration and teardown only.

use core::ffi::c_void;
use core::ptr;

use quartz_abi::RtError;
use quartz_abi::config::MAX_NAMES;
use quartz_abi::error::RtResult;
use quartz_abi::task::ObjectType;
use quartz_lib::IrqRwLock;

/// Character set for compressed names: `[0-9A-Za-z_]`, case folded to
/// upper, packed base-37. Leading `'0'` characters do not survive a
/// round trip (they encode as leading zeros); pick names accordingly.
const RADIX: u32 = 37;

/// Compress up to six name characters into a u32. Characters outside
/// the set map to `'_'`; anything after the sixth is ignored.
pub fn nam2num(name: &str) -> u32 {
    let mut num: u32 = 0;
    for c in name.bytes().take(6) {
        let digit = match c {
            b'0'..=b'9' => (c - b'0') as u32,
            b'A'..=b'Z' => (c - b'A') as u32 + 10,
            b'a'..=b'z' => (c - b'a') as u32 + 10,
            _ => 36,
        };
        num = num * RADIX + digit;
    }
    num
}

/// Expand a compressed name. Returns the number of characters written
/// into `out` (right-aligned digits, most significant first).
pub fn num2nam(mut num: u32, out: &mut [u8; 6]) -> usize {
    let mut tmp = [0u8; 6];
    let mut n = 0;
    while num != 0 && n < 6 {
        let digit = num % RADIX;
        num /= RADIX;
        tmp[n] = match digit {
            0..=9 => b'0' + digit as u8,
            10..=35 => b'A' + (digit - 10) as u8,
            _ => b'_',
        };
        n += 1;
    }
    if n == 0 {
        tmp[0] = b'0';
        n = 1;
    }
    for i in 0..n {
        out[i] = tmp[n - 1 - i];
    }
    n
}

#[derive(Clone, Copy)]
pub struct RegistryEntry {
    pub name: u32,
    pub obj_type: ObjectType,
    /// Opaque handle: arena index for tasks/sync objects, raw pointer
    /// value for anything else.
    pub adr: *mut c_void,
    /// Owner task handle raw id, or u16::MAX.
    pub owner: u16,
    /// Owner pid-equivalent from the host side, 0 when kernel-owned.
    pub owner_pid: u32,
    pub count: u32,
}

impl RegistryEntry {
    const fn empty() -> Self {
        Self {
            name: 0,
            obj_type: ObjectType::Task,
            adr: ptr::null_mut(),
            owner: u16::MAX,
            owner_pid: 0,
            count: 0,
        }
    }

    #[inline]
    fn in_use(&self) -> bool {
        self.name != 0
    }
}

struct Registry {
    slots: [RegistryEntry; MAX_NAMES],
}

// SAFETY: `adr` values are opaque cookies, never dereferenced here.
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

static REGISTRY: IrqRwLock<Registry> = IrqRwLock::new(Registry {
    slots: [RegistryEntry::empty(); MAX_NAMES],
});

/// Register an object under `name`. Fails with BUSY if the name exists
/// and NO_RESOURCE when the table is full.
pub fn register(
    name: u32,
    obj_type: ObjectType,
    adr: *mut c_void,
    owner: u16,
    owner_pid: u32,
) -> RtResult<usize> {
    if name == 0 {
        return Err(RtError::InvalidArg);
    }
    let mut registry = REGISTRY.write();
    if registry.slots.iter().any(|s| s.in_use() && s.name == name) {
        return Err(RtError::Busy);
    }
    let slot = registry
        .slots
        .iter()
        .position(|s| !s.in_use())
        .ok_or(RtError::NoResource)?;
    registry.slots[slot] = RegistryEntry {
        name,
        obj_type,
        adr,
        owner,
        owner_pid,
        count: 1,
    };
    Ok(slot)
}

/// Look an object up by name, bumping its usage count.
pub fn get_adr_cnt(name: u32) -> Option<*mut c_void> {
    let mut registry = REGISTRY.write();
    for slot in registry.slots.iter_mut() {
        if slot.in_use() && slot.name == name {
            slot.count += 1;
            return Some(slot.adr);
        }
    }
    None
}

/// Look an object up by name without touching the count.
pub fn get_adr(name: u32) -> Option<*mut c_void> {
    let registry = REGISTRY.read();
    registry
        .slots
        .iter()
        .find(|s| s.in_use() && s.name == name)
        .map(|s| s.adr)
}

pub fn get_name(adr: *mut c_void) -> Option<u32> {
    let registry = REGISTRY.read();
    registry
        .slots
        .iter()
        .find(|s| s.in_use() && s.adr == adr)
        .map(|s| s.name)
}

pub fn get_type(name: u32) -> Option<ObjectType> {
    let registry = REGISTRY.read();
    registry
        .slots
        .iter()
        .find(|s| s.in_use() && s.name == name)
        .map(|s| s.obj_type)
}

/// Drop one usage of a name. Returns the remaining count; the entry is
/// released when it reaches zero.
pub fn drop_name_cnt(name: u32) -> RtResult<u32> {
    let mut registry = REGISTRY.write();
    for slot in registry.slots.iter_mut() {
        if slot.in_use() && slot.name == name {
            slot.count = slot.count.saturating_sub(1);
            let remaining = slot.count;
            if remaining == 0 {
                *slot = RegistryEntry::empty();
            }
            return Ok(remaining);
        }
    }
    Err(RtError::InvalidArg)
}

/// Unconditionally release a name (deletion paths).
pub fn drop_name(name: u32) -> RtResult<()> {
    let mut registry = REGISTRY.write();
    for slot in registry.slots.iter_mut() {
        if slot.in_use() && slot.name == name {
            *slot = RegistryEntry::empty();
            return Ok(());
        }
    }
    Err(RtError::InvalidArg)
}

/// Deletion-path variant usable while the scheduler lock is held: the
/// registry lock nests inside it.
pub(crate) fn drop_name_inner(name: u32) {
    let _ = drop_name(name);
}

/// Read-only snapshot of one registry slot for introspection tooling.
pub fn snapshot_slot(slot: usize) -> Option<RegistryEntry> {
    if slot >= MAX_NAMES {
        return None;
    }
    let registry = REGISTRY.read();
    let entry = registry.slots[slot];
    if entry.in_use() { Some(entry) } else { None }
}

pub fn slot_count() -> usize {
    let registry = REGISTRY.read();
    registry.slots.iter().filter(|s| s.in_use()).count()
}

/// Clear the whole table (test fixtures and teardown).
pub fn reset_registry() {
    let mut registry = REGISTRY.write();
    registry.slots = [RegistryEntry::empty(); MAX_NAMES];
}

// --- Named task front-ends ---------------------------------------------------

use crate::api;
use crate::task::{TaskEntry, TaskHandle};

/// Find-or-create a named task. An existing name returns its task.
pub fn named_task_init(
    name: &str,
    entry: TaskEntry,
    arg: usize,
    stack_size: usize,
    priority: i32,
    uses_fpu: bool,
) -> RtResult<TaskHandle> {
    let num = nam2num(name);
    if let Some(adr) = get_adr(num) {
        return Ok(TaskHandle::from_raw(adr as usize as u16));
    }
    let handle = api::task_init(entry, arg, stack_size, priority, uses_fpu, None)?;
    crate::task::with_core(|core| {
        core.tasks[handle.raw() as usize].name = num;
    });
    match register(
        num,
        ObjectType::Task,
        handle.raw() as usize as *mut c_void,
        handle.raw(),
        0,
    ) {
        Ok(_) => Ok(handle),
        Err(err) => {
            let _ = api::task_delete(handle);
            Err(err)
        }
    }
}

pub fn named_task_delete(handle: TaskHandle) -> RtResult<()> {
    // task_delete drops the name itself via the record's name field.
    api::task_delete(handle)
}
