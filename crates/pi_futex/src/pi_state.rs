//! PiState：futex 字在内核侧的 PI 状态
//!
//! 每个有等待者的 PI futex 对应一个 [`PiState`]，其中的 [`RtMutex`] 承担真正的阻塞与
//! 优先级继承，`owner` 记录内核认为的持有者。
//!
//! # 引用计数
//!
//! `Arc` 只负责内存安全；协议意义上的引用由 `refcount` 单独计数：
//! 每个挂着它的等待者一个，进行中的解锁/退出清理临时各一个。
//! 持有者的 `pi_state_list` 中的 `Arc` 不计数。
//! 计数归零时把它从持有者的列表上摘下、代理解锁，然后尽量回收进当前任务的缓存。
//!
//! # 一致性表
//!
//! 已有等待者时，新的加锁者通过 [`attach_to_pi_state`] 附着到同一个 PiState，
//! 并按 futex 字与 `owner` 的组合判断状态是否合法：
//!
//! | PiState | owner | TID | OWNER_DIED | 结论 |
//! |---|---|---|---|---|
//! | 无 | - | 任意 | 任意 | 非法：PI 与非 PI 混用 |
//! | 有 | 无 | 0 | 1 | 合法：持有者已死，等待修正 |
//! | 有 | 无 | >0 | 1 | 非法 |
//! | 有 | 任务 | 0 | 1 | 合法：后继者已取得锁，TID 尚未修正 |
//! | 有 | 无 | 任意 | 0 | 非法：owner 为空必须带 OWNER_DIED |
//! | 有 | 任务 | 等于其 TID | 任意 | 合法 |
//! | 有 | 任务 | 0 | 0 | 非法 |
//! | 有 | 任务 | 不等于其 TID | 任意 | 非法 |

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use uapi::futex::{FUTEX_OWNER_DIED, futex_tid};

use crate::error::{FutexError, FutexResult};
use crate::key::FutexKey;
use crate::ops::{sched_ops, user_memory};
use crate::queue::Chain;
use crate::rtmutex::RtMutex;
use crate::task::{Task, TaskRef, TaskState, Tid, find_task, same_task};

/// 受 wait_lock 保护的持有者记录
pub(crate) struct PiOwner {
    /// `None` 表示持有者已退出、尚未被后继者修正
    pub(crate) owner: Option<TaskRef>,
}

impl PiOwner {
    pub(crate) fn is_owned_by(&self, task: &Task) -> bool {
        self.owner.as_deref().is_some_and(|o| same_task(o, task))
    }
}

/// 一个 PI futex 的内核侧状态
pub(crate) struct PiState {
    pub(crate) key: FutexKey,
    refcount: AtomicUsize,
    pub(crate) pi_mutex: RtMutex<PiOwner>,
}

/// PiState 的共享引用
pub(crate) type PiStateRef = Arc<PiState>;

impl PiState {
    fn new() -> Self {
        Self {
            key: FutexKey::private(0, 0),
            refcount: AtomicUsize::new(1),
            pi_mutex: RtMutex::new(PiOwner { owner: None }),
        }
    }

    /// 重新初始化为 `owner` 代理持有的状态
    fn reset(&mut self, key: FutexKey, owner: &TaskRef) {
        self.key = key;
        *self.refcount.get_mut() = 1;
        let core = self.pi_mutex.get_mut();
        core.init_proxy_locked(owner.clone());
        core.data.owner = Some(owner.clone());
    }

    /// 当前的协议引用计数
    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// 内核记录的持有者是否为 `task`
    pub(crate) fn owned_by(&self, task: &Task) -> bool {
        self.pi_mutex.lock_wait().data.is_owned_by(task)
    }

    /// 直接改写计数，模拟释放者已减到 0、尚未拿到 wait_lock 的状态
    #[cfg(test)]
    pub(crate) fn force_refcount(&self, count: usize) {
        self.refcount.store(count, Ordering::Release);
    }
}

/// 确保 `task` 的缓存中有一个预分配的 PiState
///
/// 在获取任何自旋锁之前调用，使持锁路径不必分配内存。
pub(crate) fn refill_pi_state_cache(task: &Task) {
    if task.pi_state_cache().is_some() {
        return;
    }
    let fresh = Arc::new(PiState::new());
    let mut slot = task.pi_state_cache();
    if slot.is_none() {
        *slot = Some(fresh);
    }
}

/// 取出当前任务缓存的 PiState，并初始化为 `owner` 代理持有
fn alloc_pi_state(key: FutexKey, owner: &TaskRef) -> PiStateRef {
    let current = sched_ops().current_task();
    let cached = current.pi_state_cache().take();
    let mut pi_state = match cached {
        Some(pi_state) => pi_state,
        None => {
            log::warn!("pi_futex: pi_state cache empty for tid {}", current.tid());
            Arc::new(PiState::new())
        }
    };
    match Arc::get_mut(&mut pi_state) {
        Some(inner) => inner.reset(key, owner),
        None => {
            pi_state = Arc::new(PiState::new());
            if let Some(inner) = Arc::get_mut(&mut pi_state) {
                inner.reset(key, owner);
            }
        }
    }
    pi_state
}

/// 增加一个协议引用
///
/// # Panics
/// 计数已为 0 时 panic：此时 PiState 已被释放或回收
pub(crate) fn get_pi_state(pi_state: &PiStateRef) -> PiStateRef {
    let old = pi_state.refcount.fetch_add(1, Ordering::AcqRel);
    assert!(old != 0, "pi_futex: get on released pi_state");
    pi_state.clone()
}

/// 计数不为 0 时增加一个协议引用
pub(crate) fn try_get_pi_state(pi_state: &PiStateRef) -> Option<PiStateRef> {
    pi_state
        .refcount
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
            (c != 0).then_some(c + 1)
        })
        .ok()
        .map(|_| pi_state.clone())
}

/// 释放一个协议引用
///
/// 计数归零时把 PiState 从持有者的列表上摘下并代理解锁，
/// 然后尝试放入当前任务的缓存。
pub(crate) fn put_pi_state(pi_state: PiStateRef) {
    if let Some(pi_state) = release_pi_state(pi_state) {
        recycle_pi_state(pi_state, &sched_ops().current_task());
    }
}

/// 同 [`put_pi_state`]，但回收进 `task` 的缓存
///
/// 退出清理时当前线程可能已不再绑定任务，不能去查询当前任务。
pub(crate) fn put_pi_state_for(pi_state: PiStateRef, task: &Task) {
    if let Some(pi_state) = release_pi_state(pi_state) {
        recycle_pi_state(pi_state, task);
    }
}

/// 减少计数；归零且没有其它 `Arc` 时返回可回收的 PiState
fn release_pi_state(pi_state: PiStateRef) -> Option<PiStateRef> {
    let old = pi_state.refcount.fetch_sub(1, Ordering::AcqRel);
    assert!(old != 0, "pi_futex: pi_state refcount underflow");
    if old != 1 {
        return None;
    }

    {
        let mut core = pi_state.pi_mutex.lock_wait();
        if let Some(owner) = core.data.owner.take() {
            owner.pi_lock().list_del(&pi_state);
            core.proxy_unlock();
        }
    }
    log::trace!("pi_futex: released pi_state for {:#x}", pi_state.key.uaddr());

    let mut pi_state = pi_state;
    Arc::get_mut(&mut pi_state).is_some().then_some(pi_state)
}

fn recycle_pi_state(pi_state: PiStateRef, task: &Task) {
    let mut slot = task.pi_state_cache();
    if slot.is_none() {
        *slot = Some(pi_state);
    }
}

/// 按已有 PiState 校验 futex 字，合法时返回新增的引用
///
/// 在 wait_lock 下重读 futex 字：与 `uval` 不一致说明解锁者刚改过它，返回 `TryAgain`。
pub(crate) fn attach_to_pi_state(
    uaddr: usize,
    uval: u32,
    pi_state: &PiStateRef,
) -> FutexResult<PiStateRef> {
    let pid = futex_tid(uval);

    let core = pi_state.pi_mutex.lock_wait();
    let cur = user_memory().read_u32(uaddr)?;
    if cur != uval {
        return Err(FutexError::TryAgain);
    }

    let owner_tid = core.data.owner.as_ref().map(|o| o.tid());
    let valid = if uval & FUTEX_OWNER_DIED != 0 {
        match owner_tid {
            // 持有者已死，只有 TID 为 0 合法
            None => pid == 0,
            Some(_) if pid == 0 => true,
            Some(tid) => pid == tid,
        }
    } else {
        owner_tid.is_some_and(|tid| pid == tid)
    };
    drop(core);

    if !valid {
        log::warn!(
            "pi_futex: futex word {:#x} at {:#x} inconsistent with pi_state owner {:?}",
            uval,
            uaddr,
            owner_tid
        );
        return Err(FutexError::InvalidState);
    }
    Ok(get_pi_state(pi_state))
}

/// 解析 futex 字中的持有者
fn find_owner(tid: Tid) -> FutexResult<TaskRef> {
    if tid == 0 {
        return Err(FutexError::NoSuchProcess);
    }
    find_task(tid).ok_or(FutexError::NoSuchProcess)
}

/// 第一个等待者：为 `uval` 中记录的持有者建立新的 PiState
///
/// 在持有者的 pi_lock 下检查其退出状态并挂入其列表，
/// 保证不会有 PiState 挂到已完成退出清理的任务上。
pub(crate) fn attach_to_pi_owner(uval: u32, key: &FutexKey) -> FutexResult<PiStateRef> {
    let owner = find_owner(futex_tid(uval))?;

    let mut pi = owner.pi_lock();
    match pi.state {
        TaskState::Alive => {}
        TaskState::ExitingCleanupPending => return Err(FutexError::TryAgain),
        TaskState::ExitingCleanupDone => return Err(FutexError::NoSuchProcess),
        TaskState::Ineligible => return Err(FutexError::PermissionDenied),
    }
    let pi_state = alloc_pi_state(*key, &owner);
    pi.list_add(pi_state.clone());
    drop(pi);

    log::debug!(
        "pi_futex: attached new pi_state for {:#x} to tid {}",
        key.uaddr(),
        owner.tid()
    );
    Ok(pi_state)
}

/// 查找或建立 `key` 对应的 PiState
///
/// 调用者持有 `chain` 所在桶的锁。
pub(crate) fn lookup_pi_state(
    uaddr: usize,
    uval: u32,
    chain: &Chain,
    key: &FutexKey,
) -> FutexResult<PiStateRef> {
    if let Some(top) = chain.top_waiter(key) {
        let pi_state = top.state().pi_state.clone();
        return match pi_state {
            Some(pi_state) => attach_to_pi_state(uaddr, uval, &pi_state),
            None => {
                log::warn!("pi_futex: non-PI waiter queued on PI futex {:#x}", uaddr);
                Err(FutexError::InvalidState)
            }
        };
    }
    attach_to_pi_owner(uval, key)
}
