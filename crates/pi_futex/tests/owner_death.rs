//! 持有者未解锁即退出后的恢复。

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use pi_futex::host;
use pi_futex::{FutexError, PiLock, TaskState, futex_waiter_count};
use test_support::wait_until;
use uapi::futex::{FUTEX_OWNER_DIED, FUTEX_WAITERS, futex_tid};

/// 在新线程里上锁后直接退出，`before_exit` 在退出前运行
fn lock_and_die(lock: &Arc<PiLock>, before_exit: impl FnOnce() + Send + 'static) -> u32 {
    let dying = lock.clone();
    let (task, h) = host::spawn(20, move || {
        dying.lock().unwrap();
        before_exit();
    });
    h.join().unwrap();
    assert_eq!(task.state(), TaskState::ExitingCleanupDone);
    task.tid()
}

#[test]
fn test_robust_owner_death_without_waiters() {
    host::init();
    let lock = Arc::new(PiLock::new_robust());
    let dead = lock_and_die(&lock, || {});
    assert_ne!(dead, 0);
    assert_eq!(lock.word(), FUTEX_OWNER_DIED);

    lock.lock().unwrap();
    assert!(lock.owner_died());
    assert_eq!(lock.owner(), host::current().tid());
    lock.mark_consistent();
    assert!(!lock.owner_died());
    lock.unlock().unwrap();
    assert_eq!(lock.word(), 0);
}

#[test]
fn test_robust_owner_death_with_waiter() {
    host::init();
    let lock = Arc::new(PiLock::new_robust());

    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (locked_tx, locked_rx) = mpsc::channel();
    let dying = lock.clone();
    let (owner, owner_handle) = host::spawn(20, move || {
        dying.lock().unwrap();
        locked_tx.send(()).unwrap();
        go_rx.recv().unwrap();
    });
    locked_rx.recv().unwrap();

    let waiter_lock = lock.clone();
    let (waiter, waiter_handle) = host::spawn(30, move || {
        waiter_lock.lock().unwrap();
        let word = waiter_lock.word();
        waiter_lock.mark_consistent();
        waiter_lock.unlock().unwrap();
        word
    });
    assert!(wait_until(Duration::from_secs(5), || {
        futex_waiter_count(lock.uaddr()) == 1
    }));
    assert_eq!(lock.word(), owner.tid() | FUTEX_WAITERS);

    // 持有者退出，等待者接手并看到 OWNER_DIED
    go_tx.send(()).unwrap();
    owner_handle.join().unwrap();
    let word = waiter_handle.join().unwrap();
    assert_eq!(futex_tid(word), waiter.tid());
    assert_ne!(word & FUTEX_OWNER_DIED, 0);
    assert_eq!(owner.pi_state_count(), 0);
    assert_eq!(lock.word(), 0);
}

#[test]
fn test_plain_owner_death_hands_lock_to_waiter() {
    host::init();
    let lock = Arc::new(PiLock::new());

    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (locked_tx, locked_rx) = mpsc::channel();
    let dying = lock.clone();
    let (owner, owner_handle) = host::spawn(20, move || {
        dying.lock().unwrap();
        locked_tx.send(()).unwrap();
        go_rx.recv().unwrap();
    });
    locked_rx.recv().unwrap();

    let waiter_lock = lock.clone();
    let (waiter, waiter_handle) = host::spawn(30, move || {
        waiter_lock.lock().unwrap();
        let died = waiter_lock.owner_died();
        let owner = waiter_lock.owner();
        waiter_lock.unlock().unwrap();
        (died, owner)
    });
    assert!(wait_until(Duration::from_secs(5), || {
        futex_waiter_count(lock.uaddr()) == 1
    }));

    go_tx.send(()).unwrap();
    owner_handle.join().unwrap();
    assert_eq!(waiter_handle.join().unwrap(), (true, waiter.tid()));
    assert_eq!(owner.pi_state_count(), 0);
    assert_eq!(lock.word(), 0);
}

#[test]
fn test_plain_owner_death_without_waiters() {
    host::init();
    let lock = Arc::new(PiLock::new());
    let dead = lock_and_die(&lock, || {});
    // 非 robust 锁不会被改写，字里仍是已不存在的 TID
    assert_eq!(lock.word(), dead);
    assert_eq!(lock.lock(), Err(FutexError::NoSuchProcess));
    assert_eq!(futex_waiter_count(lock.uaddr()), 0);
}

#[test]
fn test_robust_lock_released_normally_is_forgotten() {
    host::init();
    let lock = Arc::new(PiLock::new_robust());
    let relocked = lock.clone();
    lock_and_die(&lock, move || relocked.unlock().unwrap());
    assert_eq!(lock.word(), 0);
}
