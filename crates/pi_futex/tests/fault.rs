//! 写 futex 字时缺页或被并发改写：可修复的缺页与竞争在内部重试，不可修复的缺页才返回 Fault。

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use pi_futex::host::{self, HostMemory};
use pi_futex::{
    FutexError, FutexResult, PiLock, UserMemory, create_task, futex_waiter_count, lock_pi,
    unlock_pi,
};
use test_support::{FaultPlan, wait_until};
use uapi::futex::FUTEX_WAITERS;

/// 按 [`FaultPlan`] 注入缺页的用户内存
struct FaultyMemory {
    plan: FaultPlan,
}

impl UserMemory for FaultyMemory {
    fn read_u32(&self, uaddr: usize) -> FutexResult<u32> {
        HostMemory.read_u32(uaddr)
    }

    fn cmpxchg_u32(&self, uaddr: usize, expected: u32, new: u32) -> FutexResult<u32> {
        if self.plan.take_cmpxchg_fault(uaddr) {
            return Err(FutexError::Fault);
        }
        if let Some(bits) = self.plan.take_race(uaddr) {
            let cur = HostMemory.read_u32(uaddr)?;
            HostMemory.cmpxchg_u32(uaddr, cur, cur | bits)?;
        }
        HostMemory.cmpxchg_u32(uaddr, expected, new)
    }

    fn fault_in_writeable(&self, uaddr: usize) -> FutexResult<()> {
        if !self.plan.record_fault_in(uaddr) {
            return Err(FutexError::Fault);
        }
        HostMemory.fault_in_writeable(uaddr)
    }

    fn address_space(&self) -> usize {
        HostMemory.address_space()
    }
}

static FAULTY: FaultyMemory = FaultyMemory {
    plan: FaultPlan::new(),
};

fn setup() -> &'static FaultPlan {
    host::init_with_memory(&FAULTY);
    &FAULTY.plan
}

#[test]
fn test_fault_while_setting_waiters() {
    let plan = setup();
    let lock = Arc::new(PiLock::new());
    lock.lock().unwrap();
    plan.arm_cmpxchg(lock.uaddr(), 1);
    let before = plan.fault_in_count();

    let other = lock.clone();
    let (_, h) = host::spawn(5, move || {
        other.lock().unwrap();
        other.unlock().unwrap();
    });
    assert!(wait_until(Duration::from_secs(5), || {
        futex_waiter_count(lock.uaddr()) == 1
    }));
    assert_eq!(plan.pending(lock.uaddr()), 0);
    assert!(plan.fault_in_count() > before);
    assert_ne!(lock.word() & FUTEX_WAITERS, 0);

    lock.unlock().unwrap();
    h.join().unwrap();
    assert_eq!(lock.word(), 0);
}

#[test]
fn test_fault_while_handing_over() {
    let plan = setup();
    let lock = Arc::new(PiLock::new());
    lock.lock().unwrap();

    let (tx, rx) = mpsc::channel();
    let other = lock.clone();
    let (waiter, h) = host::spawn(5, move || {
        other.lock().unwrap();
        tx.send(other.owner()).unwrap();
        other.unlock().unwrap();
    });
    assert!(wait_until(Duration::from_secs(5), || {
        futex_waiter_count(lock.uaddr()) == 1
    }));

    // 交接时写新持有者的 CAS 缺页两次
    plan.arm_cmpxchg(lock.uaddr(), 2);
    lock.unlock().unwrap();
    assert_eq!(plan.pending(lock.uaddr()), 0);
    assert_eq!(rx.recv().unwrap(), waiter.tid());
    h.join().unwrap();
    assert_eq!(lock.word(), 0);
}

#[test]
fn test_unfixable_fault_is_reported() {
    let plan = setup();
    let owner = create_task(1);
    let word = Box::new(std::sync::atomic::AtomicU32::new(owner.tid()));
    let uaddr = word.as_ptr() as usize;
    plan.make_unfixable(uaddr);
    plan.arm_cmpxchg(uaddr, 1);

    assert_eq!(lock_pi(uaddr, None, false), Err(FutexError::Fault));
    assert_eq!(word.load(std::sync::atomic::Ordering::SeqCst), owner.tid());
    assert_eq!(futex_waiter_count(uaddr), 0);
    assert_eq!(owner.pi_state_count(), 0);
}

#[test]
fn test_fault_while_fixing_up_owner() {
    let plan = setup();
    let lock = Arc::new(PiLock::new());

    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (locked_tx, locked_rx) = mpsc::channel();
    let dying = lock.clone();
    let (_, owner_handle) = host::spawn(20, move || {
        dying.lock().unwrap();
        locked_tx.send(()).unwrap();
        go_rx.recv().unwrap();
    });
    locked_rx.recv().unwrap();

    let waiter_lock = lock.clone();
    let (waiter, waiter_handle) = host::spawn(30, move || {
        waiter_lock.lock().unwrap();
        let owner = waiter_lock.owner();
        waiter_lock.unlock().unwrap();
        owner
    });
    assert!(wait_until(Duration::from_secs(5), || {
        futex_waiter_count(lock.uaddr()) == 1
    }));

    // 后继者改写持有者时缺页，需释放两级锁调入后重试
    plan.arm_cmpxchg(lock.uaddr(), 1);
    go_tx.send(()).unwrap();
    owner_handle.join().unwrap();
    assert_eq!(waiter_handle.join().unwrap(), waiter.tid());
    assert_eq!(plan.pending(lock.uaddr()), 0);
    assert_eq!(lock.word(), 0);
}

#[test]
fn test_unlock_retries_when_waiters_bit_appears() {
    let plan = setup();
    let lock = PiLock::new();
    lock.lock().unwrap();
    let tid = host::current().tid();
    assert_eq!(lock.word(), tid);

    // 清零的 CAS 之前有加锁者置上了 WAITERS，但它还没排上队
    plan.race_cmpxchg(lock.uaddr(), FUTEX_WAITERS);
    assert_eq!(unlock_pi(lock.uaddr()), Ok(()));
    assert_eq!(plan.take_race(lock.uaddr()), None);
    assert_eq!(lock.word(), 0);
    assert_eq!(futex_waiter_count(lock.uaddr()), 0);
}
