//! 计数分配器
//!
//! 作为 `#[global_allocator]` 安装后，记录每个线程发生过多少次分配，
//! 用来断言无竞争路径不分配内存。

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

std::thread_local! {
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

fn bump() {
    // 线程退出阶段 TLS 可能已销毁，此时不计数
    let _ = ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
}

/// 转发给 [`System`] 并计数的全局分配器
pub struct CountingAllocator;

// SAFETY: 所有请求原样转发给 System
unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        bump();
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        bump();
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        bump();
        unsafe { System.realloc(ptr, layout, new_size) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

/// 当前线程迄今的分配次数
pub fn thread_allocations() -> usize {
    ALLOCATIONS.with(Cell::get)
}

/// 运行 `f`，返回其结果与期间当前线程的分配次数
pub fn count_allocations<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let before = thread_allocations();
    let ret = f();
    (ret, thread_allocations() - before)
}
