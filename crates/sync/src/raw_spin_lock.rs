//! 自旋锁实现
//!
//! 基于原子操作实现自旋锁机制，并向 `lock_api` 暴露为原始互斥量。

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

/// 自旋锁结构体，提供互斥访问临界区的能力。
///
/// 不可重入 (即同一执行流不能在持有锁时再次加锁)。
/// 通常不直接使用，而是通过 [`SpinLock`](crate::SpinLock) 包装数据。
///
/// # 示例
/// ```
/// use lock_api::RawMutex;
/// use sync::RawSpinLock;
///
/// let lock = RawSpinLock::new();
/// lock.lock();
/// assert!(lock.is_locked());
/// // SAFETY: 当前执行流持有锁
/// unsafe { lock.unlock() };
/// ```
#[derive(Debug)]
pub struct RawSpinLock {
    lock: AtomicBool,
}

impl RawSpinLock {
    /// 创建一个新的 RawSpinLock 实例。
    pub const fn new() -> Self {
        RawSpinLock {
            lock: AtomicBool::new(false),
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: lock/try_lock 通过 Acquire CAS 保证同一时刻只有一个持有者，
// unlock 使用 Release 发布临界区内的写入。
unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock::new();

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // 只读自旋，减少缓存行争用
            while self.lock.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}
