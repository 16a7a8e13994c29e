//! 用户态 PI 互斥锁
//!
//! futex 字为 0 时加锁只需一次 CAS 写入自己的 TID，解锁时反过来；
//! 只有 CAS 失败（有人持有或有等待者）才进入 [`lock_pi`] / [`unlock_pi`]。

use core::sync::atomic::{AtomicU32, Ordering};

use uapi::futex::{FUTEX_OWNER_DIED, futex_tid};

use crate::error::{FutexError, FutexResult};
use crate::lock::lock_pi;
use crate::ops::{Deadline, sched_ops};
use crate::task::Tid;
use crate::unlock::unlock_pi;

/// 带优先级继承的互斥锁
///
/// robust 锁的持有者退出时，锁字被标记为 OWNER_DIED，
/// 下一个持有者可通过 [`PiLock::owner_died`] 得知并在修复数据后调用
/// [`PiLock::mark_consistent`]。
///
/// # 示例
/// ```
/// use pi_futex::PiLock;
///
/// pi_futex::host::init();
/// let lock = PiLock::new();
/// lock.lock().unwrap();
/// assert_eq!(lock.try_lock(), Err(pi_futex::FutexError::Deadlock));
/// lock.unlock().unwrap();
/// assert_eq!(lock.owner(), 0);
/// ```
#[derive(Debug, Default)]
pub struct PiLock {
    word: AtomicU32,
    robust: bool,
}

impl PiLock {
    /// 创建未上锁的互斥锁
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            robust: false,
        }
    }

    /// 创建 robust 互斥锁，持有期间登记在持有者的 robust 列表中
    pub const fn new_robust() -> Self {
        Self {
            word: AtomicU32::new(0),
            robust: true,
        }
    }

    /// futex 字的地址
    pub fn uaddr(&self) -> usize {
        self.word.as_ptr() as usize
    }

    /// futex 字的当前值
    pub fn word(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    /// 当前持有者的 TID，0 表示未上锁
    pub fn owner(&self) -> Tid {
        futex_tid(self.word())
    }

    /// 上一个持有者是否未解锁即退出
    pub fn owner_died(&self) -> bool {
        self.word() & FUTEX_OWNER_DIED != 0
    }

    /// 清除 OWNER_DIED 标记，由修复了受保护数据的持有者调用
    pub fn mark_consistent(&self) {
        self.word.fetch_and(!FUTEX_OWNER_DIED, Ordering::AcqRel);
    }

    /// 加锁，必要时阻塞
    ///
    /// 已持有该锁时返回 [`FutexError::Deadlock`]。
    pub fn lock(&self) -> FutexResult<()> {
        self.lock_inner(None)
    }

    /// 加锁，最迟阻塞到 `deadline`
    pub fn lock_until(&self, deadline: Deadline) -> FutexResult<()> {
        self.lock_inner(Some(deadline))
    }

    fn lock_inner(&self, deadline: Option<Deadline>) -> FutexResult<()> {
        let tid = sched_ops().current_task().tid();
        if self
            .word
            .compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            loop {
                match lock_pi(self.uaddr(), deadline, false) {
                    // 中断只打断阻塞，不打断加锁
                    Err(FutexError::Interrupted) => continue,
                    res => break res?,
                }
            }
        }
        self.note_acquired();
        Ok(())
    }

    /// 尝试加锁，锁被占用时返回 `Ok(false)`
    pub fn try_lock(&self) -> FutexResult<bool> {
        let tid = sched_ops().current_task().tid();
        let locked = self
            .word
            .compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            || match lock_pi(self.uaddr(), None, true) {
                Ok(()) => true,
                Err(FutexError::WouldBlock) => false,
                Err(e) => return Err(e),
            };
        if locked {
            self.note_acquired();
        }
        Ok(locked)
    }

    /// 解锁
    ///
    /// 调用者不是持有者时返回 [`FutexError::PermissionDenied`]。
    pub fn unlock(&self) -> FutexResult<()> {
        let current = sched_ops().current_task();
        if self
            .word
            .compare_exchange(current.tid(), 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            unlock_pi(self.uaddr())?;
        }
        if self.robust {
            current.robust_unregister(self.uaddr());
        }
        Ok(())
    }

    /// 锁已被当前任务持有后的登记
    pub(crate) fn note_acquired(&self) {
        if self.robust {
            sched_ops().current_task().robust_register(self.uaddr());
        }
    }
}
