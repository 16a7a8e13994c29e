//! 带优先级继承的互斥量
//!
//! 只实现 PI futex 需要的那部分接口：
//! 代理加锁（替另一个任务排队）、等待、清理以及不经快速路径的解锁。
//! 锁本身不对应用户内存，用户态看到的只有 futex 字；
//! 这里的持有者只在有等待者时才有意义。
//!
//! 优先级继承只做一层：持有者的有效优先级等于其基础优先级与
//! 它所持有的每个 RtMutex 上最高等待者优先级中的最大值。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use sync::{SpinLock, SpinLockGuard};

use crate::error::{FutexError, FutexResult};
use crate::ops::{Deadline, sched_ops};
use crate::task::{Priority, Task, TaskRef, WakeQ, same_task};

static NEXT_MUTEX_ID: AtomicU64 = AtomicU64::new(1);

/// 排在 RtMutex 上的一个等待者
pub(crate) struct RtWaiter {
    pub(crate) task: TaskRef,
    /// 入队时的有效优先级
    pub(crate) prio: Priority,
}

impl RtWaiter {
    pub(crate) fn new(task: TaskRef) -> Arc<Self> {
        let prio = task.effective_prio();
        Arc::new(Self { task, prio })
    }
}

/// 优先级继承互斥量
///
/// `T` 是同样受 wait_lock 保护的附加数据。
pub(crate) struct RtMutex<T> {
    wait_lock: SpinLock<RtMutexCore<T>>,
}

/// 受 wait_lock 保护的部分
pub(crate) struct RtMutexCore<T> {
    id: u64,
    owner: Option<TaskRef>,
    /// 按优先级降序，同优先级先来先到
    waiters: Vec<Arc<RtWaiter>>,
    pub(crate) data: T,
}

impl<T> RtMutex<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            wait_lock: SpinLock::new(RtMutexCore {
                id: NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed),
                owner: None,
                waiters: Vec::new(),
                data,
            }),
        }
    }

    /// 获取 wait_lock
    pub(crate) fn lock_wait(&self) -> SpinLockGuard<'_, RtMutexCore<T>> {
        self.wait_lock.lock()
    }

    /// 独占访问时无需加锁
    pub(crate) fn get_mut(&mut self) -> &mut RtMutexCore<T> {
        self.wait_lock.get_mut()
    }

    /// 等待已由 [`RtMutexCore::start_proxy_lock`] 排队的 `waiter` 获得锁
    ///
    /// 不持有任何锁时调用。中断或超时返回错误，
    /// 此时 `waiter` 仍在队列中，调用者必须随后调用 [`RtMutex::cleanup_proxy_lock`]。
    pub(crate) fn wait_proxy_lock(
        &self,
        waiter: &Arc<RtWaiter>,
        deadline: Option<Deadline>,
    ) -> FutexResult<()> {
        let sched = sched_ops();
        let task = &waiter.task;
        loop {
            {
                let mut core = self.wait_lock.lock();
                if core.try_to_take(task, Some(waiter)) {
                    return Ok(());
                }
                if task.take_signal() {
                    return Err(FutexError::Interrupted);
                }
                if deadline.is_some_and(|d| sched.now() >= d) {
                    return Err(FutexError::TimedOut);
                }
            }
            sched.block(task, deadline);
        }
    }

    /// 等待失败后的清理
    ///
    /// 失败与被唤醒可能同时发生，因此先再尝试一次获取锁。
    /// 返回 `true` 表示最终没有获得锁，`waiter` 已出队。
    pub(crate) fn cleanup_proxy_lock(&self, waiter: &Arc<RtWaiter>) -> bool {
        let mut core = self.wait_lock.lock();
        let task = &waiter.task;
        core.try_to_take(task, Some(waiter));
        if core.is_owner(task) {
            return false;
        }
        core.remove_waiter(waiter);
        true
    }

    /// 解锁并在释放 wait_lock 之后唤醒下一个等待者
    pub(crate) fn futex_unlock_and_wake(&self) {
        let mut wake_q = WakeQ::new();
        let mut core = self.wait_lock.lock();
        core.futex_unlock(&mut wake_q);
        drop(core);
        wake_q.wake_up();
    }
}

impl<T> RtMutexCore<T> {
    pub(crate) fn owner(&self) -> Option<&TaskRef> {
        self.owner.as_ref()
    }

    pub(crate) fn is_owner(&self, task: &Task) -> bool {
        self.owner.as_deref().is_some_and(|o| same_task(o, task))
    }

    #[cfg(test)]
    pub(crate) fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// 把尚无等待者的锁直接设为 `owner` 持有
    ///
    /// 可能在持有 `owner` 的 pi_lock 时调用，因此不触碰优先级提升。
    pub(crate) fn init_proxy_locked(&mut self, owner: TaskRef) {
        debug_assert!(self.waiters.is_empty());
        self.owner = Some(owner);
    }

    /// 清除持有者，不唤醒任何等待者
    pub(crate) fn proxy_unlock(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.set_boost(self.id, None);
        }
    }

    /// 尝试让 `task` 成为持有者
    ///
    /// 已排队的等待者只有排在最前面时才能获得锁；
    /// 未排队的任务在没有等待者，或优先级严格高于最高等待者时可以抢占。
    fn try_to_take(&mut self, task: &TaskRef, waiter: Option<&Arc<RtWaiter>>) -> bool {
        if self.owner.is_some() {
            return false;
        }
        match waiter {
            Some(waiter) => {
                let is_top = self.waiters.first().is_some_and(|t| Arc::ptr_eq(t, waiter));
                if !is_top {
                    return false;
                }
                self.waiters.remove(0);
            }
            None => {
                if let Some(top) = self.waiters.first()
                    && task.effective_prio() <= top.prio
                {
                    return false;
                }
            }
        }
        self.owner = Some(task.clone());
        self.update_owner_boost();
        true
    }

    /// 不排队地尝试获取锁
    pub(crate) fn futex_trylock(&mut self, task: &TaskRef) -> bool {
        self.try_to_take(task, None)
    }

    /// 替 `task` 获取锁或排队
    ///
    /// `Ok(true)` 表示已直接获得锁，`Ok(false)` 表示已排队，
    /// 需要 `task` 自己调用 [`RtMutex::wait_proxy_lock`]。
    pub(crate) fn start_proxy_lock(
        &mut self,
        waiter: &Arc<RtWaiter>,
        task: &TaskRef,
    ) -> FutexResult<bool> {
        if self.try_to_take(task, None) {
            return Ok(true);
        }
        if self.is_owner(task) {
            return Err(FutexError::Deadlock);
        }
        let pos = self
            .waiters
            .iter()
            .position(|w| w.prio < waiter.prio)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, waiter.clone());
        self.update_owner_boost();
        Ok(false)
    }

    /// 解锁后将获得锁的任务
    pub(crate) fn next_owner(&self) -> Option<TaskRef> {
        self.waiters.first().map(|w| w.task.clone())
    }

    /// 清除持有者，并把最高等待者加入唤醒队列
    ///
    /// 等待者留在队列里，醒来后自己在 [`RtMutex::wait_proxy_lock`] 中取得锁。
    /// 返回是否有任务需要唤醒。
    pub(crate) fn futex_unlock(&mut self, wake_q: &mut WakeQ) -> bool {
        if let Some(owner) = self.owner.take() {
            owner.set_boost(self.id, None);
        }
        match self.waiters.first() {
            Some(top) => {
                wake_q.add(top.task.clone());
                true
            }
            None => false,
        }
    }

    fn remove_waiter(&mut self, waiter: &Arc<RtWaiter>) -> bool {
        let Some(idx) = self.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) else {
            return false;
        };
        self.waiters.remove(idx);
        self.update_owner_boost();
        true
    }

    fn update_owner_boost(&self) {
        if let Some(owner) = &self.owner {
            owner.set_boost(self.id, self.waiters.first().map(|w| w.prio));
        }
    }
}
