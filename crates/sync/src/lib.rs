//! 同步原语
//!
//! 向 futex 核心提供自旋锁，用于实现三级锁层次：
//! 哈希桶锁、PI 互斥量内部的 wait_lock 以及任务自身的 pi_lock。
//!
//! 原始锁 [`RawSpinLock`] 实现了 [`lock_api::RawMutex`]，
//! 数据锁 [`SpinLock`] 直接复用 `lock_api::Mutex` 的 RAII 守卫，
//! 因此可以使用 `MutexGuard::unlocked` 等工具临时释放锁。
//!
//! 用户态环境下没有中断可关，这里的锁只负责互斥，不做中断保护。

#![no_std]

mod raw_spin_lock;
mod spin_lock;

pub use raw_spin_lock::*;
pub use spin_lock::*;
