/*
 * Kernel Heap
 *
 * A fixed 4 MiB arena in BSS handed to linked_list_allocator at boot. Thread
 * stacks, control blocks and every alloc collection in the kernel come from
 * here. Exhaustion is fatal; the kernel has no story for recovering from a
 * failed allocation.
 *
 * The allocator lock must never be held by a thread that can be switched
 * away, because the scheduler frees TCBs while holding its own lock with
 * the alarm masked and would spin forever behind a preempted owner. Every
 * heap operation therefore runs with interrupts off.
 */

use core::alloc::{GlobalAlloc, Layout};
use linked_list_allocator::LockedHeap;
use x86_64::instructions::interrupts;

pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

struct KernelHeap {
    heap: LockedHeap,
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        interrupts::without_interrupts(|| unsafe { self.heap.alloc(layout) })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        interrupts::without_interrupts(|| unsafe { self.heap.dealloc(ptr, layout) })
    }
}

#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap { heap: LockedHeap::empty() };

#[repr(C, align(4096))]
struct HeapArena([u8; HEAP_SIZE]);

static mut HEAP_ARENA: HeapArena = HeapArena([0; HEAP_SIZE]);

pub fn init() {
    unsafe {
        let bottom = core::ptr::addr_of_mut!(HEAP_ARENA) as *mut u8;
        ALLOCATOR.heap.lock().init(bottom, HEAP_SIZE);
    }
    log::info!("Kernel heap initialized ({} KiB)", HEAP_SIZE / 1024);
}

#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout);
}
