//! 优先级继承：等待者抬高持有者，离开后恢复。

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use pi_futex::host;
use pi_futex::{FutexError, PiLock, TaskRef, futex_waiter_count};
use uapi::futex::FUTEX_WAITERS;
use test_support::wait_until;

const LOW: u8 = 10;
const MID: u8 = 40;
const HIGH: u8 = 80;

/// 抢占依赖于被唤醒的等待者还没来得及运行，多试几轮
const STEAL_ATTEMPTS: usize = 20;

/// 让一个低优先级线程持有锁，直到 `release` 收到消息
fn low_prio_owner(lock: &Arc<PiLock>) -> (TaskRef, mpsc::Sender<()>, JoinHandle<()>) {
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let owner_lock = lock.clone();
    let (task, handle) = host::spawn(LOW, move || {
        owner_lock.lock().unwrap();
        locked_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        owner_lock.unlock().unwrap();
    });
    locked_rx.recv().unwrap();
    (task, release_tx, handle)
}

#[test]
fn test_waiter_boosts_owner() {
    host::init();
    let lock = Arc::new(PiLock::new());
    let (owner, release, owner_handle) = low_prio_owner(&lock);
    assert_eq!(owner.effective_prio(), LOW);

    let (order_tx, order_rx) = mpsc::channel();
    let waiter = |prio: u8| {
        let (lock, order) = (lock.clone(), order_tx.clone());
        host::spawn(prio, move || {
            lock.lock().unwrap();
            order.send(prio).unwrap();
            lock.unlock().unwrap();
        })
        .1
    };

    let mid = waiter(MID);
    assert!(wait_until(Duration::from_secs(5), || owner.effective_prio() == MID));
    let high = waiter(HIGH);
    assert!(wait_until(Duration::from_secs(5), || owner.effective_prio() == HIGH));
    assert_eq!(futex_waiter_count(lock.uaddr()), 2);

    release.send(()).unwrap();
    owner_handle.join().unwrap();
    assert_eq!(owner.effective_prio(), LOW);

    high.join().unwrap();
    mid.join().unwrap();
    drop(order_tx);
    assert_eq!(order_rx.iter().collect::<Vec<_>>(), [HIGH, MID]);
    assert_eq!(lock.word(), 0);
}

#[test]
fn test_boost_dropped_when_waiter_times_out() {
    host::init();
    let lock = Arc::new(PiLock::new());
    let (owner, release, owner_handle) = low_prio_owner(&lock);

    let high_lock = lock.clone();
    let (_, high) = host::spawn(HIGH, move || {
        high_lock.lock_until(host::deadline_after(Duration::from_millis(500)))
    });
    assert!(wait_until(Duration::from_secs(5), || owner.effective_prio() == HIGH));

    assert_eq!(high.join().unwrap(), Err(FutexError::TimedOut));
    assert_eq!(owner.effective_prio(), LOW);
    assert_eq!(owner.pi_state_count(), 0);

    release.send(()).unwrap();
    owner_handle.join().unwrap();
    assert_eq!(lock.word(), 0);
}

#[test]
fn test_boost_dropped_when_waiter_interrupted() {
    host::init();
    let lock = Arc::new(PiLock::new());
    let (owner, release, owner_handle) = low_prio_owner(&lock);

    let uaddr = lock.uaddr();
    let (waiter, high) = host::spawn(HIGH, move || pi_futex::lock_pi(uaddr, None, false));
    assert!(wait_until(Duration::from_secs(5), || owner.effective_prio() == HIGH));

    waiter.interrupt();
    assert_eq!(high.join().unwrap(), Err(FutexError::Interrupted));
    assert_eq!(owner.effective_prio(), LOW);
    assert_eq!(futex_waiter_count(uaddr), 0);

    release.send(()).unwrap();
    owner_handle.join().unwrap();
    assert_eq!(lock.word(), 0);
}

#[test]
fn test_interrupted_pi_lock_keeps_waiting() {
    host::init();
    let lock = Arc::new(PiLock::new());
    let (owner, release, owner_handle) = low_prio_owner(&lock);

    let waiter_lock = lock.clone();
    let (waiter, handle) = host::spawn(MID, move || {
        waiter_lock.lock().unwrap();
        waiter_lock.unlock().unwrap();
    });
    assert!(wait_until(Duration::from_secs(5), || owner.effective_prio() == MID));

    // PiLock 在中断后重新等待，不会放弃
    waiter.interrupt();
    assert!(wait_until(Duration::from_secs(5), || {
        futex_waiter_count(lock.uaddr()) == 1 && owner.effective_prio() == MID
    }));

    release.send(()).unwrap();
    owner_handle.join().unwrap();
    handle.join().unwrap();
    assert_eq!(lock.word(), 0);
}

#[test]
fn test_higher_priority_locker_steals_handed_over_lock() {
    host::init();
    let lock = Arc::new(PiLock::new());

    let thief_lock = lock.clone();
    let (_, thief) = host::spawn(HIGH, move || {
        let lock = thief_lock;
        let tid = host::current().tid();
        for _ in 0..STEAL_ATTEMPTS {
            lock.lock().unwrap();
            let (acquired_tx, acquired_rx) = mpsc::channel();
            let waiter_lock = lock.clone();
            let (_, waiter) = host::spawn(LOW, move || {
                waiter_lock.lock().unwrap();
                acquired_tx.send(()).unwrap();
                waiter_lock.unlock().unwrap();
            });
            assert!(wait_until(Duration::from_secs(5), || {
                futex_waiter_count(lock.uaddr()) == 1
            }));

            // 移交给低优先级等待者后立即重新加锁
            lock.unlock().unwrap();
            lock.lock().unwrap();
            let stolen = acquired_rx.try_recv().is_err();
            if stolen {
                // 等待者仍在排队，futex 字已修正为抢占者
                assert_eq!(lock.word(), tid | FUTEX_WAITERS);
                assert_eq!(futex_waiter_count(lock.uaddr()), 1);
            }

            lock.unlock().unwrap();
            waiter.join().unwrap();
            if stolen {
                assert!(acquired_rx.try_recv().is_ok());
                return true;
            }
        }
        false
    });

    assert!(thief.join().unwrap());
    assert_eq!(lock.word(), 0);
}
