//! requeue-PI：把条件变量上的等待者迁到 PI 锁上
//!
//! 等待者先在普通 futex（`uaddr`）上睡眠，并声明自己期望被迁往的 PI futex（`uaddr2`）。
//! 唤醒方通过 [`cmp_requeue_pi`] 尝试直接替最高等待者取得 PI 锁；
//! 取不到时把等待者排到 PI 锁的 RtMutex 上并迁到目标桶，
//! 等持有者解锁时再由 RtMutex 唤醒。这样唤醒条件变量不会造成惊群。

use crate::error::{FutexError, FutexResult};
use crate::key::{FutexKey, get_futex_key};
use crate::lock::{AtomicLock, fixup_owner, fixup_pi_state_owner, lock_pi_atomic, unqueue_me_pi};
use crate::ops::{Deadline, sched_ops, user_memory};
use crate::pi_state::{
    PiStateRef, get_pi_state, lookup_pi_state, put_pi_state, refill_pi_state_cache,
};
use crate::queue::{
    BucketPair, FUTEX_QUEUES, FutexQ, QRef, q_lock, queue_me, requeue_futex, unqueue_futex,
};
use crate::rtmutex::RtWaiter;
use crate::task::Tid;

/// [`try_proxy_lock`] 的结果
pub(crate) enum GrantOutcome {
    /// 源 key 上没有等待者
    NothingToDo,
    /// 最高等待者已取得锁并被唤醒
    Acquired(Tid),
    /// 锁被占用，已附着到该 PiState（持有一个协议引用）
    WouldBlock(PiStateRef),
}

/// 替 `key1` 上的最高等待者原子地尝试获取 `pi_uaddr` 上的 PI 锁
///
/// 调用者持有两个桶锁。最高等待者声明的目标不是 `key2` 时返回 `InvalidState`，
/// 此时不修改任何状态。
pub(crate) fn try_proxy_lock(
    pi_uaddr: usize,
    pair: &mut BucketPair<'_>,
    key1: &FutexKey,
    key2: &FutexKey,
    idx2: usize,
    set_waiters: bool,
) -> FutexResult<GrantOutcome> {
    let Some(top) = pair.chain1().top_waiter(key1) else {
        return Ok(GrantOutcome::NothingToDo);
    };

    if top.state().requeue_pi_key != Some(*key2) {
        return Err(FutexError::InvalidState);
    }

    match lock_pi_atomic(pi_uaddr, pair.chain2(), key2, &top.task, set_waiters)? {
        AtomicLock::Acquired => {
            requeue_pi_wake_futex(&top, key2, idx2, pair);
            Ok(GrantOutcome::Acquired(top.task.tid()))
        }
        AtomicLock::Attached(pi_state) => Ok(GrantOutcome::WouldBlock(pi_state)),
    }
}

/// 唤醒一个已被授予 PI 锁的 requeue 等待者
///
/// 改写 key、从源桶出队、清除 rt_waiter 并记录目标桶；
/// 等待者醒来后据 rt_waiter 为空得知自己已经持有锁。
pub(crate) fn requeue_pi_wake_futex(
    q: &QRef,
    key2: &FutexKey,
    idx2: usize,
    pair: &mut BucketPair<'_>,
) {
    {
        let mut st = q.state();
        st.key = *key2;
        st.rt_waiter = None;
    }
    unqueue_futex(pair.chain1(), q);
    q.set_bucket(idx2);
    sched_ops().wake(&q.task);
}

/// 在 `uaddr` 上等待，期望被 requeue 到 PI futex `uaddr2` 上
///
/// `*uaddr != val` 时立即返回 [`FutexError::WouldBlock`]。
/// 成功返回时调用者持有 `uaddr2` 上的 PI 锁。
/// 被 requeue 之前的中断返回 [`FutexError::Interrupted`]，之后的中断报告为
/// [`FutexError::WouldBlock`]；没被 requeue 就醒来同样报告为 `WouldBlock`。
pub fn wait_requeue_pi(
    uaddr: usize,
    val: u32,
    deadline: Option<Deadline>,
    uaddr2: usize,
) -> FutexResult<()> {
    if uaddr == uaddr2 {
        return Err(FutexError::InvalidState);
    }
    let key1 = get_futex_key(uaddr)?;
    let key2 = get_futex_key(uaddr2)?;
    let mem = user_memory();
    let sched = sched_ops();
    let current = sched.current_task();

    let rt_waiter = RtWaiter::new(current.clone());
    let q = FutexQ::new(current.clone(), key1);
    {
        let mut st = q.state();
        st.rt_waiter = Some(rt_waiter.clone());
        st.requeue_pi_key = Some(key2);
    }
    let idx1 = FUTEX_QUEUES.hash(&key1);

    // 在桶锁下比较后入队，唤醒方的比较与之互斥
    loop {
        let mut chain = FUTEX_QUEUES.lock(idx1);
        match mem.read_u32(uaddr) {
            Ok(cur) if cur != val => return Err(FutexError::WouldBlock),
            Ok(_) => {
                queue_me(&mut chain, &q, idx1);
                break;
            }
            Err(FutexError::Fault) => {
                drop(chain);
                mem.fault_in_writeable(uaddr)?;
            }
            Err(e) => return Err(e),
        }
    }

    let reason = loop {
        if q.key() != key1 {
            break None;
        }
        if current.signal_pending() {
            break Some(FutexError::Interrupted);
        }
        if deadline.is_some_and(|d| sched.now() >= d) {
            break Some(FutexError::TimedOut);
        }
        sched.block(&current, deadline);
    };

    // 持有源桶锁判断是否已被 requeue：唤醒方迁移等待者时同样持有它
    {
        let mut chain = FUTEX_QUEUES.lock(idx1);
        if q.key() != key2 {
            unqueue_futex(&mut chain, &q);
            drop(chain);
            return Err(match reason {
                Some(FutexError::Interrupted) => {
                    current.take_signal();
                    FutexError::Interrupted
                }
                Some(e) => e,
                None => FutexError::WouldBlock,
            });
        }
    }

    let (pi_state, acquired) = {
        let st = q.state();
        (st.pi_state.clone(), st.rt_waiter.is_none())
    };
    let mut unlock_state = None;

    let mut ret = if acquired {
        // requeue 时已被直接授予锁，只可能需要修正持有者
        let mut ret = Ok(());
        if let Some(pi_state) = pi_state {
            let mut chain = q_lock(&q);
            if !pi_state.owned_by(&current) {
                ret = fixup_pi_state_owner(uaddr2, &pi_state, &mut chain, &current);
                if ret.is_err() && pi_state.pi_mutex.lock_wait().is_owner(&current) {
                    unlock_state = Some(get_pi_state(&pi_state));
                }
            }
            drop(pi_state);
            let taken = q.state().pi_state.take();
            if let Some(taken) = taken {
                put_pi_state(taken);
            }
            drop(chain);
        }
        ret
    } else {
        let Some(pi_state) = pi_state else {
            unreachable!("pi_futex: requeued waiter without pi_state");
        };
        let mut ret = pi_state.pi_mutex.wait_proxy_lock(&rt_waiter, deadline);

        let mut chain = q_lock(&q);
        if ret.is_err() && !pi_state.pi_mutex.cleanup_proxy_lock(&rt_waiter) {
            ret = Ok(());
        }
        match fixup_owner(uaddr2, &q, &pi_state, &mut chain, ret.is_ok()) {
            Ok(true) => ret = Ok(()),
            Ok(false) => {}
            Err(e) => ret = Err(e),
        }
        if ret.is_err() && pi_state.pi_mutex.lock_wait().is_owner(&current) {
            unlock_state = Some(get_pi_state(&pi_state));
        }
        drop(pi_state);
        unqueue_me_pi(&q, chain);
        ret
    };

    if let Some(pi_state) = unlock_state {
        pi_state.pi_mutex.futex_unlock_and_wake();
        put_pi_state(pi_state);
    }

    // 已经离开条件变量，不能让调用者重新等待
    if ret == Err(FutexError::Interrupted) {
        ret = Err(FutexError::WouldBlock);
    }
    ret
}

/// 比较 `*uaddr1` 与 `cmpval` 后，把其上的 requeue-PI 等待者迁到 PI futex `uaddr2`
///
/// 最高等待者若能直接取得锁则被唤醒；其余至多 `nr_requeue` 个等待者
/// （直接取锁失败时包括最高等待者本身）排到 PI 锁上。
/// 返回被唤醒与被迁移的等待者总数。
pub fn cmp_requeue_pi(
    uaddr1: usize,
    uaddr2: usize,
    nr_requeue: usize,
    cmpval: u32,
) -> FutexResult<usize> {
    if uaddr1 == uaddr2 {
        return Err(FutexError::InvalidState);
    }
    let key1 = get_futex_key(uaddr1)?;
    let key2 = get_futex_key(uaddr2)?;
    if key1 == key2 {
        return Err(FutexError::InvalidState);
    }
    let mem = user_memory();
    let sched = sched_ops();
    let current = sched.current_task();
    let idx1 = FUTEX_QUEUES.hash(&key1);
    let idx2 = FUTEX_QUEUES.hash(&key2);
    let limit = nr_requeue.saturating_add(1);

    refill_pi_state_cache(&current);

    'retry: loop {
        let mut pair = FUTEX_QUEUES.lock_pair(idx1, idx2);

        match mem.read_u32(uaddr1) {
            Ok(cur) if cur != cmpval => return Err(FutexError::WouldBlock),
            Ok(_) => {}
            Err(FutexError::Fault) => {
                drop(pair);
                mem.fault_in_writeable(uaddr1)?;
                continue;
            }
            Err(e) => return Err(e),
        }

        let mut task_count = 0;
        let grant = match try_proxy_lock(uaddr2, &mut pair, &key1, &key2, idx2, nr_requeue > 0) {
            Ok(GrantOutcome::NothingToDo) => Ok(None),
            Ok(GrantOutcome::WouldBlock(pi_state)) => Ok(Some(pi_state)),
            Ok(GrantOutcome::Acquired(tid)) => {
                task_count += 1;
                if nr_requeue == 0 {
                    Ok(None)
                } else {
                    // 还要继续迁移：为新持有者建立 PiState
                    lookup_pi_state(uaddr2, tid, pair.chain2(), &key2).map(Some)
                }
            }
            Err(e) => Err(e),
        };
        let pi_state = match grant {
            Ok(found) => found,
            Err(FutexError::Fault) => {
                drop(pair);
                mem.fault_in_writeable(uaddr2)?;
                continue 'retry;
            }
            Err(FutexError::TryAgain) => {
                drop(pair);
                sched.yield_now();
                continue 'retry;
            }
            Err(e) => return Err(e),
        };

        let mut ret = Ok(());
        for this in pair.chain1().waiters_on(&key1) {
            if task_count >= limit {
                break;
            }
            let (rt_waiter, requeue_key, has_pi_state) = {
                let st = this.state();
                (st.rt_waiter.clone(), st.requeue_pi_key, st.pi_state.is_some())
            };
            // 普通等待者或目标不符：用户态混用了 futex
            let Some(rt_waiter) = rt_waiter.filter(|_| !has_pi_state) else {
                ret = Err(FutexError::InvalidState);
                break;
            };
            if requeue_key != Some(key2) {
                ret = Err(FutexError::InvalidState);
                break;
            }
            let Some(target) = pi_state.as_ref() else {
                break;
            };
            task_count += 1;

            this.state().pi_state = Some(get_pi_state(target));
            let started = target
                .pi_mutex
                .lock_wait()
                .start_proxy_lock(&rt_waiter, &this.task);
            match started {
                // 代理加锁时恰好取得了锁
                Ok(true) => requeue_pi_wake_futex(&this, &key2, idx2, &mut pair),
                Ok(false) => requeue_futex(&mut pair, &this, &key2, idx2),
                Err(e) => {
                    let taken = this.state().pi_state.take();
                    if let Some(taken) = taken {
                        put_pi_state(taken);
                    }
                    ret = Err(e);
                    break;
                }
            }
        }

        if let Some(pi_state) = pi_state {
            put_pi_state(pi_state);
        }
        drop(pair);

        log::debug!(
            "pi_futex: requeued {} waiter(s) from {:#x} to {:#x}",
            task_count,
            uaddr1,
            uaddr2
        );
        return ret.map(|()| task_count);
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::host;
    use crate::queue::QLink;
    use crate::task::create_task;

    struct Setup {
        word1: AtomicU32,
        word2: AtomicU32,
    }

    impl Setup {
        fn new() -> Self {
            host::init();
            Self {
                word1: AtomicU32::new(0),
                word2: AtomicU32::new(0),
            }
        }

        fn keys(&self) -> (FutexKey, FutexKey) {
            (
                get_futex_key(self.word1.as_ptr() as usize).unwrap(),
                get_futex_key(self.word2.as_ptr() as usize).unwrap(),
            )
        }

        fn enqueue_waiter(&self, requeue_to: FutexKey) -> QRef {
            let (key1, _) = self.keys();
            let task = create_task(1);
            let q = FutexQ::new(task.clone(), key1);
            {
                let mut st = q.state();
                st.rt_waiter = Some(RtWaiter::new(task));
                st.requeue_pi_key = Some(requeue_to);
            }
            let idx1 = FUTEX_QUEUES.hash(&key1);
            queue_me(&mut FUTEX_QUEUES.lock(idx1), &q, idx1);
            q
        }
    }

    #[test]
    fn test_mismatched_target_leaves_waiter_untouched() {
        let s = Setup::new();
        let (key1, key2) = s.keys();
        let elsewhere = FutexKey::private(usize::MAX, 0x40);
        let q = s.enqueue_waiter(elsewhere);
        let (idx1, idx2) = (FUTEX_QUEUES.hash(&key1), FUTEX_QUEUES.hash(&key2));

        {
            let mut pair = FUTEX_QUEUES.lock_pair(idx1, idx2);
            let res = try_proxy_lock(s.word2.as_ptr() as usize, &mut pair, &key1, &key2, idx2, true);
            assert!(matches!(res, Err(FutexError::InvalidState)));
            assert!(pair.chain1().top_waiter(&key1).is_some());
        }

        assert_eq!(s.word2.load(Ordering::Relaxed), 0);
        {
            let st = q.state();
            assert_eq!(st.key, key1);
            assert_eq!(st.link, QLink::Queued);
            assert!(st.rt_waiter.is_some());
            assert!(st.pi_state.is_none());
            assert_eq!(st.requeue_pi_key, Some(elsewhere));
        }
        assert_eq!(q.bucket_index(), idx1);

        unqueue_futex(&mut q_lock(&q), &q);
    }

    #[test]
    fn test_nothing_to_do_without_waiters() {
        let s = Setup::new();
        let (key1, key2) = s.keys();
        let (idx1, idx2) = (FUTEX_QUEUES.hash(&key1), FUTEX_QUEUES.hash(&key2));
        let mut pair = FUTEX_QUEUES.lock_pair(idx1, idx2);
        let res = try_proxy_lock(s.word2.as_ptr() as usize, &mut pair, &key1, &key2, idx2, false);
        assert!(matches!(res, Ok(GrantOutcome::NothingToDo)));
    }

    #[test]
    fn test_free_lock_is_granted_to_top_waiter() {
        let s = Setup::new();
        let (key1, key2) = s.keys();
        let q = s.enqueue_waiter(key2);
        let (idx1, idx2) = (FUTEX_QUEUES.hash(&key1), FUTEX_QUEUES.hash(&key2));

        {
            let mut pair = FUTEX_QUEUES.lock_pair(idx1, idx2);
            let res = try_proxy_lock(s.word2.as_ptr() as usize, &mut pair, &key1, &key2, idx2, false);
            let Ok(GrantOutcome::Acquired(tid)) = res else {
                panic!("expected the free lock to be granted");
            };
            assert_eq!(tid, q.task.tid());
        }

        assert_eq!(s.word2.load(Ordering::Relaxed), q.task.tid());
        let st = q.state();
        assert_eq!(st.key, key2);
        assert_eq!(st.link, QLink::Dequeued);
        assert!(st.rt_waiter.is_none());
        assert_eq!(q.bucket_index(), idx2);
    }

    #[test]
    fn test_cmp_requeue_rejects_same_address_and_stale_value() {
        let s = Setup::new();
        let a1 = s.word1.as_ptr() as usize;
        let a2 = s.word2.as_ptr() as usize;
        assert_eq!(cmp_requeue_pi(a1, a1, 1, 0), Err(FutexError::InvalidState));
        s.word1.store(3, Ordering::Relaxed);
        assert_eq!(cmp_requeue_pi(a1, a2, 1, 2), Err(FutexError::WouldBlock));
        assert_eq!(cmp_requeue_pi(a1, a2, 1, 3), Ok(0));
    }
}
