//! futex 哈希桶与等待队列项
//!
//! 每个在内核侧等待 futex 的任务对应一个 [`FutexQ`]，挂在由 key 哈希得到的桶上。
//! 桶内按优先级降序排列，同优先级先来先到。
//!
//! `FutexQ` 记录自己当前所在的桶号；requeue 会修改它，
//! 因此重新获取桶锁时必须用 [`q_lock`] 反复校验。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hash::BuildHasher;
use core::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::DefaultHashBuilder;
use sync::{SpinLock, SpinLockGuard};

use crate::config::FUTEX_HASH_SIZE;
use crate::key::{FutexKey, get_futex_key};
use crate::pi_state::PiStateRef;
use crate::rtmutex::RtWaiter;
use crate::task::{Priority, TaskRef};

/// 队列项的链接状态
///
/// 每个 `FutexQ` 只会入队一次、出队一次；重复出队意味着两条路径都以为自己负责清理。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QLink {
    Idle,
    Queued,
    Dequeued,
}

/// 受队列项自身锁保护的字段
///
/// 叶子锁：持有它时不得再获取任何其它锁。
pub(crate) struct QState {
    pub(crate) key: FutexKey,
    /// 计数引用，由等待者在出队后释放
    pub(crate) pi_state: Option<PiStateRef>,
    /// requeue-PI 等待者预先准备的 RtMutex 等待项；
    /// 被 requeue 直接授予锁时清空
    pub(crate) rt_waiter: Option<Arc<RtWaiter>>,
    /// requeue-PI 等待者期望被迁往的 key
    pub(crate) requeue_pi_key: Option<FutexKey>,
    pub(crate) link: QLink,
}

/// 一个在 futex 上等待的任务
pub(crate) struct FutexQ {
    pub(crate) task: TaskRef,
    pub(crate) prio: Priority,
    bucket: AtomicUsize,
    state: SpinLock<QState>,
}

/// 队列项的共享引用
pub(crate) type QRef = Arc<FutexQ>;

impl FutexQ {
    pub(crate) fn new(task: TaskRef, key: FutexKey) -> QRef {
        let prio = task.effective_prio();
        Arc::new(Self {
            task,
            prio,
            bucket: AtomicUsize::new(usize::MAX),
            state: SpinLock::new(QState {
                key,
                pi_state: None,
                rt_waiter: None,
                requeue_pi_key: None,
                link: QLink::Idle,
            }),
        })
    }

    pub(crate) fn state(&self) -> SpinLockGuard<'_, QState> {
        self.state.lock()
    }

    pub(crate) fn key(&self) -> FutexKey {
        self.state.lock().key
    }

    pub(crate) fn bucket_index(&self) -> usize {
        self.bucket.load(Ordering::Acquire)
    }

    pub(crate) fn set_bucket(&self, idx: usize) {
        self.bucket.store(idx, Ordering::Release);
    }
}

/// 一个哈希桶中的等待者
pub(crate) struct Chain {
    waiters: Vec<QRef>,
}

impl Chain {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: Vec::new(),
        }
    }

    /// 该 key 上优先级最高的等待者
    pub(crate) fn top_waiter(&self, key: &FutexKey) -> Option<QRef> {
        self.waiters.iter().find(|q| q.key() == *key).cloned()
    }

    /// 该 key 上的所有等待者，按出队顺序排列
    pub(crate) fn waiters_on(&self, key: &FutexKey) -> Vec<QRef> {
        self.waiters
            .iter()
            .filter(|q| q.key() == *key)
            .cloned()
            .collect()
    }

    fn count(&self, key: &FutexKey) -> usize {
        self.waiters.iter().filter(|q| q.key() == *key).count()
    }

    /// 插到所有不低于它的优先级的等待者之后
    fn insert(&mut self, q: QRef) {
        let pos = self
            .waiters
            .iter()
            .position(|w| w.prio < q.prio)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, q);
    }

    fn remove(&mut self, q: &QRef) -> bool {
        match self.waiters.iter().position(|w| Arc::ptr_eq(w, q)) {
            Some(idx) => {
                self.waiters.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// 桶锁的 RAII 守卫
pub(crate) type BucketGuard<'a> = SpinLockGuard<'a, Chain>;

/// 全局 futex 哈希表
pub(crate) struct FutexHashTable {
    buckets: Box<[SpinLock<Chain>]>,
    hasher: DefaultHashBuilder,
}

impl FutexHashTable {
    fn new() -> Self {
        let buckets = (0..FUTEX_HASH_SIZE)
            .map(|_| SpinLock::new(Chain::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            hasher: DefaultHashBuilder::default(),
        }
    }

    /// key 所在的桶号
    pub(crate) fn hash(&self, key: &FutexKey) -> usize {
        (self.hasher.hash_one(key) as usize) & (FUTEX_HASH_SIZE - 1)
    }

    pub(crate) fn lock(&self, idx: usize) -> BucketGuard<'_> {
        self.buckets[idx].lock()
    }

    /// 按桶号从小到大锁住两个桶；同一个桶只锁一次
    pub(crate) fn lock_pair(&self, idx1: usize, idx2: usize) -> BucketPair<'_> {
        if idx1 == idx2 {
            return BucketPair {
                lo: self.lock(idx1),
                hi: None,
                swapped: false,
            };
        }
        let (a, b, swapped) = if idx1 < idx2 {
            (idx1, idx2, false)
        } else {
            (idx2, idx1, true)
        };
        let lo = self.lock(a);
        let hi = self.lock(b);
        BucketPair {
            lo,
            hi: Some(hi),
            swapped,
        }
    }
}

lazy_static::lazy_static! {
    /// 全局 futex 哈希表实例
    pub(crate) static ref FUTEX_QUEUES: FutexHashTable = FutexHashTable::new();
}

/// 同时持有的两个桶锁
///
/// `chain1` 对应第一个 key 的桶，`chain2` 对应第二个；两者可能是同一个桶。
pub(crate) struct BucketPair<'a> {
    lo: BucketGuard<'a>,
    hi: Option<BucketGuard<'a>>,
    swapped: bool,
}

impl BucketPair<'_> {
    pub(crate) fn chain1(&mut self) -> &mut Chain {
        match (self.hi.as_mut(), self.swapped) {
            (Some(hi), true) => &mut **hi,
            _ => &mut self.lo,
        }
    }

    pub(crate) fn chain2(&mut self) -> &mut Chain {
        match (self.hi.as_mut(), self.swapped) {
            (Some(hi), false) => &mut **hi,
            _ => &mut self.lo,
        }
    }

    /// 两个不同桶的 (chain1, chain2)；同一个桶时返回 `None`
    pub(crate) fn split(&mut self) -> Option<(&mut Chain, &mut Chain)> {
        let hi = &mut **self.hi.as_mut()?;
        let lo = &mut *self.lo;
        if self.swapped {
            Some((hi, lo))
        } else {
            Some((lo, hi))
        }
    }
}

/// 入队并记录所在桶，调用者持有该桶的锁
pub(crate) fn queue_me(chain: &mut Chain, q: &QRef, idx: usize) {
    {
        let mut st = q.state();
        assert_eq!(st.link, QLink::Idle, "futex_q queued twice");
        st.link = QLink::Queued;
    }
    q.set_bucket(idx);
    chain.insert(q.clone());
}

/// 出队，调用者持有 q 所在桶的锁
pub(crate) fn unqueue_futex(chain: &mut Chain, q: &QRef) {
    {
        let mut st = q.state();
        assert_eq!(st.link, QLink::Queued, "futex_q dequeued twice");
        st.link = QLink::Dequeued;
    }
    let removed = chain.remove(q);
    assert!(removed, "futex_q missing from its bucket");
}

/// 在两个桶之间移动仍在队列中的 q，并改写它的 key
pub(crate) fn requeue_futex(pair: &mut BucketPair<'_>, q: &QRef, key2: &FutexKey, idx2: usize) {
    if let Some((chain1, chain2)) = pair.split() {
        let removed = chain1.remove(q);
        assert!(removed, "futex_q missing from its bucket");
        chain2.insert(q.clone());
    }
    q.state().key = *key2;
    q.set_bucket(idx2);
}

/// 锁住 q 当前所在的桶
///
/// q 可能在加锁期间被 requeue 到别的桶，加锁后重新校验桶号。
pub(crate) fn q_lock(q: &FutexQ) -> BucketGuard<'static> {
    loop {
        let idx = q.bucket_index();
        let guard = FUTEX_QUEUES.lock(idx);
        if q.bucket_index() == idx {
            return guard;
        }
    }
}

/// `uaddr` 上当前在内核侧排队的等待者数量
pub fn futex_waiter_count(uaddr: usize) -> usize {
    let Ok(key) = get_futex_key(uaddr) else {
        return 0;
    };
    let idx = FUTEX_QUEUES.hash(&key);
    FUTEX_QUEUES.lock(idx).count(&key)
}
