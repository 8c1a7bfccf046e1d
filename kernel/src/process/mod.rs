// Process lifecycle glue (spec.md section 6, "To the process lifecycle").
// Deliberately thin: no scheduler, no context switch, no ELF loader —
// this crate's scope is the VM core, so "current process" is tracked
// as a single slot rather than a run queue, and `exit_current` is the
// one piece of process teardown the fault handler needs to call.
// Grounded on the teacher's `process::executor::EXECUTOR` for the
// shape of a lazily-initialized global table behind a spinlock.
pub mod pcb;

use crate::vm::pagetable::PageTableHandle;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use pcb::{AddressSpace, ProcessControlBlock, ProcessId};
use spin::Mutex;

struct ProcessTable {
    processes: BTreeMap<ProcessId, ProcessControlBlock>,
    owners: BTreeMap<usize, Arc<Mutex<AddressSpace>>>,
    current: Option<ProcessId>,
    next_pid: u64,
}

impl ProcessTable {
    const fn empty() -> Self {
        Self {
            processes: BTreeMap::new(),
            owners: BTreeMap::new(),
            current: None,
            next_pid: 1,
        }
    }
}

lazy_static! {
    static ref TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::empty());
}

fn pt_key(pt: &Arc<Mutex<PageTableHandle>>) -> usize {
    Arc::as_ptr(pt) as usize
}

/// Create a fresh process with an empty address space and make it the
/// table's current process if none is set yet.
pub fn spawn() -> ProcessId {
    let mut table = TABLE.lock();
    let pid = ProcessId(table.next_pid);
    table.next_pid += 1;
    let pcb = ProcessControlBlock::new(pid);
    table.owners.insert(pt_key(&pcb.address_space.lock().page_table.clone()), pcb.address_space.clone());
    if table.current.is_none() {
        table.current = Some(pid);
    }
    table.processes.insert(pid, pcb);
    pid
}

pub fn set_current(pid: ProcessId) {
    TABLE.lock().current = Some(pid);
}

pub fn current_pid() -> Option<ProcessId> {
    TABLE.lock().current
}

pub fn address_space_of(pid: ProcessId) -> Option<Arc<Mutex<AddressSpace>>> {
    TABLE.lock().processes.get(&pid).map(|p| p.address_space.clone())
}

/// The address space the fault handler and syscall layer operate on.
pub fn current_address_space() -> Option<Arc<Mutex<AddressSpace>>> {
    let table = TABLE.lock();
    let pid = table.current?;
    table.processes.get(&pid).map(|p| p.address_space.clone())
}

/// Resolve a frame tenant's page table back to the address space that
/// owns it, for `vm::frame`'s eviction callback.
pub fn owner_of_page_table(pt: &Arc<Mutex<PageTableHandle>>) -> Option<Arc<Mutex<AddressSpace>>> {
    TABLE.lock().owners.get(&pt_key(pt)).cloned()
}

/// Register an address space created outside `spawn` (fork's child).
pub fn register_child(pid: ProcessId, address_space: Arc<Mutex<AddressSpace>>) {
    let mut table = TABLE.lock();
    table.owners.insert(pt_key(&address_space.lock().page_table.clone()), address_space.clone());
    table.processes.insert(
        pid,
        ProcessControlBlock {
            pid,
            address_space,
            exit_code: None,
        },
    );
}

pub fn alloc_pid() -> ProcessId {
    let mut table = TABLE.lock();
    let pid = ProcessId(table.next_pid);
    table.next_pid += 1;
    pid
}

/// Tear down the current process's SPT and MT and remove it from the
/// table. Called by the page-fault handler on an unrecoverable fault
/// and, in a full system, by the `exit` syscall.
pub fn exit_current(code: i32) {
    let (pid, address_space) = {
        let table = TABLE.lock();
        let Some(pid) = table.current else { return };
        let Some(pcb) = table.processes.get(&pid) else {
            return;
        };
        (pid, pcb.address_space.clone())
    };

    {
        let mut aspace = address_space.lock();
        let aspace = &mut *aspace;
        let pt = aspace.page_table.clone();
        for addr in aspace.mt.addresses() {
            let _ = crate::vm::mmap::munmap(&mut aspace.spt, &mut aspace.mt, &pt, addr);
        }
        aspace.spt.destroy_all(&pt);
    }

    let mut table = TABLE.lock();
    if let Some(pcb) = table.processes.get_mut(&pid) {
        pcb.exit_code = Some(code);
    }
    let key = pt_key(&address_space.lock().page_table.clone());
    table.owners.remove(&key);
    table.processes.remove(&pid);
    if table.current == Some(pid) {
        table.current = None;
    }
    crate::serial_println!("process {} exited with code {}", pid.0, code);
}
