//! PI futex 解锁与所有权移交
//!
//! 有等待者时，解锁者在 wait_lock 下选出下一个持有者，
//! 用一次 CAS 把它的 TID 写进 futex 字。CAS 成功之后用户态已经能看到新持有者，
//! 剩下的链表迁移与 RtMutex 解锁都不允许失败。

use sync::SpinLockGuard;
use uapi::futex::{FUTEX_WAITERS, futex_tid};

use crate::error::{FutexError, FutexResult};
use crate::key::get_futex_key;
use crate::ops::{get_user, sched_ops, user_memory};
use crate::pi_state::{PiOwner, PiStateRef, get_pi_state, put_pi_state};
use crate::queue::FUTEX_QUEUES;
use crate::rtmutex::RtMutexCore;
use crate::task::WakeQ;

/// 释放 `uaddr` 上的 PI 锁
///
/// 调用者必须是 futex 字记录的持有者，否则返回 [`FutexError::PermissionDenied`]。
/// 与加锁者的瞬态竞争在内部重试。
pub fn unlock_pi(uaddr: usize) -> FutexResult<()> {
    let mem = user_memory();
    let sched = sched_ops();
    loop {
        match futex_unlock_pi(uaddr) {
            Err(FutexError::TryAgain) => sched.yield_now(),
            Err(FutexError::Fault) => mem.fault_in_writeable(uaddr)?,
            res => return res,
        }
    }
}

/// 一次解锁尝试，`TryAgain` 与 `Fault` 由调用者重试
fn futex_unlock_pi(uaddr: usize) -> FutexResult<()> {
    let key = get_futex_key(uaddr)?;
    let mem = user_memory();
    let current = sched_ops().current_task();

    let uval = get_user(uaddr)?;
    if futex_tid(uval) != current.tid() {
        return Err(FutexError::PermissionDenied);
    }

    let chain = FUTEX_QUEUES.lock(FUTEX_QUEUES.hash(&key));

    let top = chain.top_waiter(&key);
    if let Some(top) = top {
        let Some(pi_state) = top.state().pi_state.clone() else {
            log::warn!("pi_futex: non-PI waiter queued on PI futex {:#x}", uaddr);
            return Err(FutexError::InvalidState);
        };

        let core = pi_state.pi_mutex.lock_wait();
        if !core.data.is_owned_by(&current) {
            log::warn!(
                "pi_futex: tid {} unlocking {:#x} owned by another pi_state owner",
                current.tid(),
                uaddr
            );
            return Err(FutexError::InvalidState);
        }
        let extra = get_pi_state(&pi_state);
        // 持有 wait_lock 时放掉桶锁，移交期间等待者无法离开
        drop(chain);

        let ret = wake_futex_pi(uaddr, uval, &extra, core);
        put_pi_state(extra);
        return ret;
    }

    // 没有等待者：直接清零；失败说明有人刚置了 WAITERS
    let cur = mem.cmpxchg_u32(uaddr, uval, 0)?;
    drop(chain);
    if cur != uval {
        return Err(FutexError::TryAgain);
    }
    Ok(())
}

/// 把锁移交给 RtMutex 上的最高等待者
fn wake_futex_pi(
    uaddr: usize,
    uval: u32,
    pi_state: &PiStateRef,
    mut core: SpinLockGuard<'_, RtMutexCore<PiOwner>>,
) -> FutexResult<()> {
    // 记录着等待者却没有下一个持有者：加锁者还没来得及排上 RtMutex，让它先完成
    let Some(new_owner) = core.next_owner() else {
        log::warn!("pi_futex: {:#x} has a queued waiter but no next owner", uaddr);
        return Err(FutexError::TryAgain);
    };

    // 新值总是带 WAITERS，OWNER_DIED 被清除
    let newval = FUTEX_WAITERS | new_owner.tid();
    let cur = user_memory().cmpxchg_u32(uaddr, uval, newval)?;
    if cur != uval {
        if futex_tid(cur) == futex_tid(uval) {
            return Err(FutexError::TryAgain);
        }
        log::warn!(
            "pi_futex: futex word {:#x} at {:#x} changed under the owner",
            cur,
            uaddr
        );
        return Err(FutexError::InvalidState);
    }

    // 以下步骤不允许失败
    if let Some(old) = core.data.owner.take() {
        let removed = old.pi_lock().list_del(pi_state);
        debug_assert!(removed, "pi_state missing from its owner's list");
    }
    new_owner.pi_lock().list_add(pi_state.clone());
    core.data.owner = Some(new_owner.clone());

    let mut wake_q = WakeQ::new();
    core.futex_unlock(&mut wake_q);
    drop(core);
    wake_q.wake_up();

    log::debug!("pi_futex: {:#x} handed over to tid {}", uaddr, new_owner.tid());
    Ok(())
}
