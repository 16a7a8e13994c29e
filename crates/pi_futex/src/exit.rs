//! 任务退出时的 futex 清理
//!
//! 退出的任务可能仍持有 PI 锁：
//!
//! 1. 登记为 robust 的 futex 字若仍记录着它，改写为 `WAITERS | OWNER_DIED`，TID 清零；
//! 2. 它作为持有者的每个 PiState 被摘下、标记为无主，并唤醒一个后继者，
//!    后继者在修正持有者时把 OWNER_DIED 带进新的 futex 字。
//!
//! 清理进行期间任务处于 `ExitingCleanupPending`，新的等待者会重试而不是附着上来。

use alloc::sync::Arc;

use uapi::futex::{FUTEX_OWNER_DIED, FUTEX_WAITERS, futex_tid};

use crate::error::{FutexError, FutexResult};
use crate::ops::user_memory;
use crate::pi_state::{PiStateRef, put_pi_state_for, try_get_pi_state};
use crate::queue::FUTEX_QUEUES;
use crate::task::{TaskRef, TaskState, WakeQ, unregister_task};

/// 释放 `task` 作为持有者的所有 PiState
///
/// 每个 PiState 被标记为无主，其 RtMutex 被解锁并唤醒一个等待者。
pub fn on_task_exit(task: &TaskRef) {
    loop {
        let head = match task.pi_lock().list_head() {
            Some(head) => head.clone(),
            None => break,
        };
        exit_pi_state(task, &head);
    }
}

/// 释放 `task` 列表头上的 `head`
///
/// 按桶锁、wait_lock、pi_lock 的顺序重新加锁；
/// 此前 `head` 已被解锁或修正路径摘走时什么也不做，由调用者重新读表头。
fn exit_pi_state(task: &TaskRef, head: &PiStateRef) {
    let key = head.key;

    let chain = FUTEX_QUEUES.lock(FUTEX_QUEUES.hash(&key));
    let mut core = head.pi_mutex.lock_wait();
    let mut pi = task.pi_lock();
    if !pi.list_head().is_some_and(|h| Arc::ptr_eq(h, head)) {
        return;
    }
    pi.list_del(head);
    drop(pi);
    core.data.owner = None;

    // 计数已归零说明释放者正等在 wait_lock 上，它会看到 owner 为空
    let Some(pi_state) = try_get_pi_state(head) else {
        core.proxy_unlock();
        return;
    };
    drop(chain);

    let mut wake_q = WakeQ::new();
    core.futex_unlock(&mut wake_q);
    drop(core);
    wake_q.wake_up();

    log::debug!(
        "pi_futex: released pi_state of {:#x} held by exiting tid {}",
        key.uaddr(),
        task.tid()
    );
    put_pi_state_for(pi_state, task);
}

/// 处理一个 robust futex：仍记录着 `task` 时改写为 `WAITERS | OWNER_DIED`
fn handle_futex_death(uaddr: usize, task: &TaskRef) -> FutexResult<()> {
    let mem = user_memory();
    loop {
        let uval = match mem.read_u32(uaddr) {
            Ok(uval) => uval,
            Err(FutexError::Fault) => {
                mem.fault_in_writeable(uaddr)?;
                continue;
            }
            Err(e) => return Err(e),
        };
        if futex_tid(uval) != task.tid() {
            return Ok(());
        }
        let newval = (uval & FUTEX_WAITERS) | FUTEX_OWNER_DIED;
        match mem.cmpxchg_u32(uaddr, uval, newval) {
            Ok(cur) if cur == uval => return Ok(()),
            Ok(_) => {}
            Err(FutexError::Fault) => mem.fault_in_writeable(uaddr)?,
            Err(e) => return Err(e),
        }
    }
}

/// 任务退出时的完整 futex 清理
///
/// 依次处理 robust futex、释放 PiState，最后把任务从注册表中移除。
/// 每个任务只能调用一次。
pub fn futex_exit(task: &TaskRef) {
    task.set_state(TaskState::ExitingCleanupPending);

    for uaddr in task.take_robust_list() {
        if let Err(e) = handle_futex_death(uaddr, task) {
            log::warn!(
                "pi_futex: robust futex {:#x} of tid {}: {}",
                uaddr,
                task.tid(),
                e
            );
        }
    }

    on_task_exit(task);

    task.set_state(TaskState::ExitingCleanupDone);
    unregister_task(task.tid());
    task.pi_state_cache().take();
}
