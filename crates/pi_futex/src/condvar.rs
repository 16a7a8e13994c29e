//! 与 [`PiLock`] 配合的条件变量
//!
//! 等待者睡在序号字上，并声明自己要被 requeue 到互斥锁上；
//! 通知者递增序号后用 [`cmp_requeue_pi`] 把等待者直接迁到锁上，
//! 被唤醒者返回时已经持有锁。

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::{FutexError, FutexResult};
use crate::mutex::PiLock;
use crate::ops::Deadline;
use crate::requeue::{cmp_requeue_pi, wait_requeue_pi};

/// 优先级继承条件变量
///
/// 同一时刻只应与一个 [`PiLock`] 搭配使用。
#[derive(Debug, Default)]
pub struct PiCondvar {
    seq: AtomicU32,
    /// 最近一次等待所用互斥锁的 futex 地址
    mutex: AtomicUsize,
}

impl PiCondvar {
    /// 创建条件变量
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            mutex: AtomicUsize::new(0),
        }
    }

    /// 序号字的地址，等待者睡在这个 futex 上
    pub fn uaddr(&self) -> usize {
        self.seq.as_ptr() as usize
    }

    /// 释放 `lock` 并等待通知，返回时重新持有 `lock`
    ///
    /// 允许伪唤醒，调用者需在循环中检查条件。
    pub fn wait(&self, lock: &PiLock) -> FutexResult<()> {
        self.wait_inner(lock, None)
    }

    /// 同 [`PiCondvar::wait`]，到达 `deadline` 时返回 [`FutexError::TimedOut`]，
    /// 此时同样已重新持有 `lock`
    pub fn wait_until(&self, lock: &PiLock, deadline: Deadline) -> FutexResult<()> {
        self.wait_inner(lock, Some(deadline))
    }

    fn wait_inner(&self, lock: &PiLock, deadline: Option<Deadline>) -> FutexResult<()> {
        self.mutex.store(lock.uaddr(), Ordering::SeqCst);
        let seq = self.seq.load(Ordering::SeqCst);
        lock.unlock()?;

        match wait_requeue_pi(self.uaddr(), seq, deadline, lock.uaddr()) {
            Ok(()) => {
                lock.note_acquired();
                Ok(())
            }
            // 序号已变或提前醒来：按伪唤醒处理
            Err(FutexError::WouldBlock) | Err(FutexError::Interrupted) => lock.lock(),
            Err(e) => {
                lock.lock()?;
                Err(e)
            }
        }
    }

    /// 唤醒一个等待者，返回被唤醒或迁移的等待者数量
    pub fn notify_one(&self) -> FutexResult<usize> {
        self.notify(0)
    }

    /// 唤醒所有等待者：一个直接取得锁，其余排到锁上
    pub fn notify_all(&self) -> FutexResult<usize> {
        self.notify(usize::MAX)
    }

    fn notify(&self, nr_requeue: usize) -> FutexResult<usize> {
        let mut seq = self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let mutex = self.mutex.load(Ordering::SeqCst);
        if mutex == 0 {
            return Ok(0);
        }
        loop {
            match cmp_requeue_pi(self.uaddr(), mutex, nr_requeue, seq) {
                // 并发的通知者又改了序号，用新值重来
                Err(FutexError::WouldBlock) => seq = self.seq.load(Ordering::SeqCst),
                res => return res,
            }
        }
    }
}
