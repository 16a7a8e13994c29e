//! Futex 用户态 ABI
//!
//! PI futex 字是一个 32 位无符号整数：
//!
//! | 位 | 含义 |
//! |---|---|
//! | 31 | `FUTEX_WAITERS`：至少有一个等待者在内核侧排队 |
//! | 30 | `FUTEX_OWNER_DIED`：上一个持有者未释放即退出 |
//! | 0..=29 | 持有者 TID，0 表示未上锁 |
//!
//! 布局与 Linux 保持一致，以便与现有二进制共享同一个 futex 字。

use bitflags::bitflags;

/// 有等待者在内核侧排队
pub const FUTEX_WAITERS: u32 = 0x8000_0000;
/// 持有者已退出但未解锁
pub const FUTEX_OWNER_DIED: u32 = 0x4000_0000;
/// 持有者 TID 掩码
pub const FUTEX_TID_MASK: u32 = 0x3fff_ffff;

// futex 操作码
pub const FUTEX_WAIT: u32 = 0;
pub const FUTEX_LOCK_PI: u32 = 6;
pub const FUTEX_UNLOCK_PI: u32 = 7;
pub const FUTEX_TRYLOCK_PI: u32 = 8;
pub const FUTEX_WAIT_REQUEUE_PI: u32 = 11;
pub const FUTEX_CMP_REQUEUE_PI: u32 = 12;

/// 操作码所占的位
pub const FUTEX_CMD_MASK: u32 = !(FutexOpFlags::all().bits());

bitflags! {
    /// 与操作码按位或的修饰标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FutexOpFlags: u32 {
        /// 进程私有 futex
        const PRIVATE = 128;
        /// 超时基于 CLOCK_REALTIME
        const CLOCK_REALTIME = 256;
    }
}

/// 从 futex 字中取出持有者 TID
#[inline]
pub const fn futex_tid(uval: u32) -> u32 {
    uval & FUTEX_TID_MASK
}

/// 拆分操作字为 (操作码, 标志)
#[inline]
pub fn futex_op_split(op: u32) -> (u32, FutexOpFlags) {
    (op & FUTEX_CMD_MASK, FutexOpFlags::from_bits_truncate(op))
}
