//! PI futex 加锁
//!
//! 无竞争时用户态的一次 CAS 即可完成加锁；进入这里说明 futex 字非 0。
//! 慢速路径先置 WAITERS 位迫使持有者走内核解锁，再附着 PiState、排队，
//! 最后阻塞在 PiState 的 RtMutex 上。醒来后无论成败都要修正持有者，
//! 因为超时与获得锁可能同时发生。

use alloc::sync::Arc;

use lock_api::MutexGuard;
use uapi::futex::{FUTEX_OWNER_DIED, FUTEX_WAITERS, futex_tid};

use crate::error::{FutexError, FutexResult};
use crate::key::{FutexKey, get_futex_key};
use crate::ops::{Deadline, get_user, sched_ops, user_memory};
use crate::pi_state::{
    PiStateRef, attach_to_pi_owner, attach_to_pi_state, get_pi_state, put_pi_state,
    refill_pi_state_cache,
};
use crate::queue::{
    BucketGuard, Chain, FUTEX_QUEUES, FutexQ, QRef, q_lock, queue_me, unqueue_futex,
};
use crate::rtmutex::RtWaiter;
use crate::task::TaskRef;

/// [`lock_pi_atomic`] 的结果
pub(crate) enum AtomicLock {
    /// 直接在 futex 字上取得了锁
    Acquired,
    /// 需要阻塞，已附着到该 PiState（持有一个协议引用）
    Attached(PiStateRef),
}

/// 在桶锁下尝试原子地为 `task` 取得锁，否则附着到 PiState
///
/// `set_waiters` 为真时，即使直接取得锁也置上 WAITERS 位；
/// requeue 一次迁移多个等待者时需要这样做。
pub(crate) fn lock_pi_atomic(
    uaddr: usize,
    chain: &Chain,
    key: &FutexKey,
    task: &TaskRef,
    set_waiters: bool,
) -> FutexResult<AtomicLock> {
    let mem = user_memory();
    let vpid = task.tid();

    let uval = mem.read_u32(uaddr)?;
    if futex_tid(uval) == vpid {
        return Err(FutexError::Deadlock);
    }

    // 已有等待者：附着到它的 PiState
    if let Some(top) = chain.top_waiter(key) {
        let pi_state = top.state().pi_state.clone();
        return match pi_state {
            Some(pi_state) => attach_to_pi_state(uaddr, uval, &pi_state).map(AtomicLock::Attached),
            None => Err(FutexError::InvalidState),
        };
    }

    // 无人持有（或持有者已死且经过 robust 处理）：直接接管，保留 OWNER_DIED
    if futex_tid(uval) == 0 {
        let mut newval = (uval & FUTEX_OWNER_DIED) | vpid;
        if set_waiters {
            newval |= FUTEX_WAITERS;
        }
        if mem.cmpxchg_u32(uaddr, uval, newval)? != uval {
            return Err(FutexError::TryAgain);
        }
        return Ok(AtomicLock::Acquired);
    }

    // 先置 WAITERS，持有者此后只能走内核解锁路径
    let newval = uval | FUTEX_WAITERS;
    if mem.cmpxchg_u32(uaddr, uval, newval)? != uval {
        return Err(FutexError::TryAgain);
    }

    attach_to_pi_owner(newval, key).map(AtomicLock::Attached)
}

/// 获取 `uaddr` 上的 PI 锁
///
/// `try_only` 为真时不阻塞，锁被占用返回 [`FutexError::WouldBlock`]。
/// 阻塞等待可被 `deadline` 或中断打断。瞬态竞争在内部重试；
/// 只有缺页无法修复时才返回 [`FutexError::Fault`]。
pub fn lock_pi(uaddr: usize, deadline: Option<Deadline>, try_only: bool) -> FutexResult<()> {
    let key = get_futex_key(uaddr)?;
    let mem = user_memory();
    let sched = sched_ops();
    let current = sched.current_task();

    // 无等待者且未上锁：一次 CAS，不碰哈希桶也不分配
    let uval = get_user(uaddr)?;
    if futex_tid(uval) == current.tid() {
        return Err(FutexError::Deadlock);
    }
    if uval == 0 && mem.cmpxchg_u32(uaddr, 0, current.tid()) == Ok(0) {
        return Ok(());
    }

    refill_pi_state_cache(&current);
    let q = FutexQ::new(current.clone(), key);
    let idx = FUTEX_QUEUES.hash(&key);

    let (pi_state, mut chain) = loop {
        let chain = FUTEX_QUEUES.lock(idx);
        match lock_pi_atomic(uaddr, &chain, &key, &current, false) {
            Ok(AtomicLock::Acquired) => return Ok(()),
            Ok(AtomicLock::Attached(pi_state)) => break (pi_state, chain),
            Err(FutexError::Fault) => {
                drop(chain);
                mem.fault_in_writeable(uaddr)?;
            }
            Err(FutexError::TryAgain) => {
                // 持有者正在退出，或者 futex 字刚被改过
                drop(chain);
                sched.yield_now();
            }
            Err(e) => return Err(e),
        }
    };

    q.state().pi_state = Some(pi_state.clone());
    queue_me(&mut chain, &q, idx);

    let mut ret = if try_only {
        let locked = pi_state.pi_mutex.lock_wait().futex_trylock(&current);
        if locked {
            Ok(())
        } else {
            Err(FutexError::WouldBlock)
        }
    } else {
        let waiter = RtWaiter::new(current.clone());
        // 先拿 wait_lock 再放桶锁，解锁者无法在两者之间插入
        let mut core = pi_state.pi_mutex.lock_wait();
        drop(chain);
        let started = core.start_proxy_lock(&waiter, &current);
        drop(core);

        let mut ret = match started {
            Ok(true) => Ok(()),
            Ok(false) => pi_state.pi_mutex.wait_proxy_lock(&waiter, deadline),
            Err(e) => Err(e),
        };

        chain = q_lock(&q);
        // 失败与获得锁可能同时发生，清理时若发现已是持有者则视为成功
        if ret.is_err() && !pi_state.pi_mutex.cleanup_proxy_lock(&waiter) {
            ret = Ok(());
        }
        ret
    };

    match fixup_owner(uaddr, &q, &pi_state, &mut chain, ret.is_ok()) {
        Ok(true) => ret = Ok(()),
        Ok(false) => {}
        Err(e) => ret = Err(e),
    }

    // 修正失败但仍持有 RtMutex：必须释放，否则锁被永久占用
    let unlock_state = if ret.is_err() && pi_state.pi_mutex.lock_wait().is_owner(&current) {
        Some(get_pi_state(&pi_state))
    } else {
        None
    };

    drop(pi_state);
    unqueue_me_pi(&q, chain);

    if let Some(pi_state) = unlock_state {
        pi_state.pi_mutex.futex_unlock_and_wake();
        put_pi_state(pi_state);
    }

    if let Err(e) = ret {
        log::trace!("pi_futex: tid {} lock {:#x} failed: {}", current.tid(), uaddr, e);
    }
    ret
}

/// 醒来后修正持有者
///
/// 调用者持有 q 所在桶的锁。返回锁最终是否被持有。
pub(crate) fn fixup_owner(
    uaddr: usize,
    q: &FutexQ,
    pi_state: &PiStateRef,
    chain: &mut BucketGuard<'_>,
    locked: bool,
) -> FutexResult<bool> {
    let current = &q.task;

    if locked {
        // 拿到了 RtMutex 但内核记录的持有者不是自己：锁被抢占过，或前任已死
        if !pi_state.owned_by(current) {
            fixup_pi_state_owner(uaddr, pi_state, chain, current)?;
        }
        return Ok(true);
    }

    if pi_state.pi_mutex.lock_wait().is_owner(current) {
        log::error!(
            "pi_futex: tid {} owns the rt_mutex of {:#x} after a failed acquire",
            current.tid(),
            uaddr
        );
    }
    Ok(false)
}

/// 把 futex 字的 TID 部分改为 `newtid`，保留 OWNER_DIED
fn write_owner_tid(uaddr: usize, newtid: u32) -> FutexResult<()> {
    let mem = user_memory();
    let mut uval = mem.read_u32(uaddr)?;
    loop {
        let newval = (uval & FUTEX_OWNER_DIED) | newtid;
        let cur = mem.cmpxchg_u32(uaddr, uval, newval)?;
        if cur == uval {
            return Ok(());
        }
        uval = cur;
    }
}

fn same_owner(a: &Option<TaskRef>, b: &Option<TaskRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// 把 futex 字与 PiState 的持有者改为 `newowner`
///
/// 调用者持有 q 所在桶的锁。写 futex 字缺页时暂时释放 wait_lock 与桶锁，
/// 调入页面后按原顺序重新获取；若期间已有别人修正过则直接返回。
pub(crate) fn fixup_pi_state_owner(
    uaddr: usize,
    pi_state: &PiStateRef,
    chain: &mut BucketGuard<'_>,
    newowner: &TaskRef,
) -> FutexResult<()> {
    let mem = user_memory();
    let mut core = pi_state.pi_mutex.lock_wait();

    let oldowner = loop {
        let oldowner = core.data.owner.clone();
        let mut newtid = newowner.tid() | FUTEX_WAITERS;
        if oldowner.is_none() {
            newtid |= FUTEX_OWNER_DIED;
        }

        match write_owner_tid(uaddr, newtid) {
            Ok(()) => break oldowner,
            Err(FutexError::Fault) => {
                let res = MutexGuard::unlocked(&mut core, || {
                    MutexGuard::unlocked(&mut *chain, || mem.fault_in_writeable(uaddr))
                });
                if !same_owner(&core.data.owner, &oldowner) {
                    return Ok(());
                }
                if let Err(e) = res {
                    log::warn!("pi_futex: cannot fault in {:#x} during owner fixup", uaddr);
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    };

    if let Some(old) = &oldowner {
        let removed = old.pi_lock().list_del(pi_state);
        debug_assert!(removed, "pi_state missing from its owner's list");
    }
    core.data.owner = Some(newowner.clone());
    newowner.pi_lock().list_add(pi_state.clone());
    log::debug!(
        "pi_futex: {:#x} owner fixed up to tid {}",
        uaddr,
        newowner.tid()
    );
    Ok(())
}

/// 出队并释放等待者持有的 PiState 引用，同时释放桶锁
pub(crate) fn unqueue_me_pi(q: &QRef, mut chain: BucketGuard<'_>) {
    unqueue_futex(&mut chain, q);
    let pi_state = q.state().pi_state.take();
    match pi_state {
        Some(pi_state) => put_pi_state(pi_state),
        None => unreachable!("pi_futex: PI waiter without pi_state"),
    }
    drop(chain);
}
