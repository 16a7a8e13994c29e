//! 优先级继承 futex
//!
//! 用户态的 PI 锁在无竞争时只对一个 32 位 futex 字做一次 CAS；
//! 出现竞争时，由本库在“内核侧”建立 PiState，
//! 把等待者排进一个带优先级继承的 rt_mutex，从而抬高持有者的优先级。
//!
//! # 组成
//!
//! - [`lock_pi`] / [`unlock_pi`]：加锁、解锁与所有权移交
//! - [`wait_requeue_pi`] / [`cmp_requeue_pi`]：条件变量等待者直接被迁移到 PI 锁上
//! - [`futex_exit`]：任务退出时的 robust 处理与 PiState 回收
//! - [`PiLock`] / [`PiCondvar`]：建立在上述操作之上的用户态封装
//! - [`do_futex`]：类系统调用的分发入口
//!
//! # 锁层次
//!
//! 三级锁必须按固定顺序获取：
//!
//! 1. 哈希桶锁
//! 2. PiState 内部 RtMutex 的 wait_lock
//! 3. 任务的 pi_lock
//!
//! 任何可能缺页或阻塞的操作都不得在持有自旋锁时进行。
//!
//! # 运行时
//!
//! 访问用户内存与调度相关的操作由宿主通过 [`register_futex_ops`]
//! （或分别通过 [`register_user_memory`] 和 [`register_sched_ops`]）注入。启用 `std` 特性时，[`host`] 模块提供基于线程的实现。

#![no_std]

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
mod condvar;
mod error;
mod exit;
mod key;
mod lock;
mod mutex;
mod ops;
mod pi_state;
mod queue;
mod requeue;
mod rtmutex;
mod syscall;
mod task;
mod unlock;

#[cfg(feature = "std")]
pub mod host;

pub use condvar::PiCondvar;
pub use error::{FutexError, FutexResult};
pub use exit::{futex_exit, on_task_exit};
pub use key::{FutexKey, get_futex_key};
pub use lock::lock_pi;
pub use mutex::PiLock;
pub use ops::{
    Deadline, SchedOps, UserMemory, register_futex_ops, register_sched_ops,
    register_user_memory, sched_ops, user_memory,
};
pub use queue::futex_waiter_count;
pub use requeue::{cmp_requeue_pi, wait_requeue_pi};
pub use syscall::{FutexArgs, do_futex};
pub use task::{
    Priority, Task, TaskRef, TaskState, Tid, create_kernel_task, create_task, find_task,
};
pub use unlock::unlock_pi;
