//! 基于 std 线程的宿主实现
//!
//! 每个线程绑定一个 [`Task`]，睡眠与唤醒直接映射到 `park`/`unpark`；
//! futex 字就是进程内存中的 `AtomicU32`。主要供测试和用户态演示使用。
//!
//! [`Task`]: crate::Task

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use std::cell::RefCell;
use std::sync::Once;
use std::thread::{self, JoinHandle, Thread};
use std::time::Instant;

use hashbrown::HashMap;
use sync::SpinLock;

use crate::config::DEFAULT_PRIO;
use crate::error::{FutexError, FutexResult};
use crate::exit::futex_exit;
use crate::ops::{Deadline, SchedOps, UserMemory, register_futex_ops, register_user_memory};
use crate::task::{Priority, TaskRef, Tid, create_task};

lazy_static::lazy_static! {
    static ref EPOCH: Instant = Instant::now();
    /// TID 到所绑定线程的映射，唤醒时查找
    static ref THREADS: SpinLock<HashMap<Tid, Thread>> = SpinLock::new(HashMap::new());
}

std::thread_local! {
    static CURRENT: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
}

/// 直接访问本进程内存的 [`UserMemory`]
#[derive(Debug, Default)]
pub struct HostMemory;

impl HostMemory {
    fn word(uaddr: usize) -> FutexResult<&'static AtomicU32> {
        if uaddr == 0 || uaddr % 4 != 0 {
            return Err(FutexError::Fault);
        }
        // SAFETY: 调用者传入的地址来自存活的 AtomicU32，且只做原子访问
        Ok(unsafe { AtomicU32::from_ptr(uaddr as *mut u32) })
    }
}

impl UserMemory for HostMemory {
    fn read_u32(&self, uaddr: usize) -> FutexResult<u32> {
        Ok(Self::word(uaddr)?.load(Ordering::SeqCst))
    }

    fn cmpxchg_u32(&self, uaddr: usize, expected: u32, new: u32) -> FutexResult<u32> {
        match Self::word(uaddr)?.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(old) | Err(old) => Ok(old),
        }
    }

    fn fault_in_writeable(&self, uaddr: usize) -> FutexResult<()> {
        Self::word(uaddr).map(|_| ())
    }

    fn address_space(&self) -> usize {
        std::process::id() as usize
    }
}

/// 以线程 park/unpark 实现的 [`SchedOps`]
#[derive(Debug, Default)]
pub struct HostSched;

impl SchedOps for HostSched {
    fn current_task(&self) -> TaskRef {
        current()
    }

    fn block(&self, task: &TaskRef, deadline: Option<Deadline>) {
        debug_assert_eq!(task.tid(), current().tid(), "block on a foreign task");
        match deadline {
            Some(deadline) => {
                let left = deadline.saturating_since(self.now());
                if !left.is_zero() {
                    thread::park_timeout(left);
                }
            }
            None => thread::park(),
        }
    }

    fn wake(&self, task: &TaskRef) {
        // 没有绑定线程的任务只存在于内核侧，忽略
        if let Some(thread) = THREADS.lock().get(&task.tid()) {
            thread.unpark();
        }
    }

    fn yield_now(&self) {
        thread::yield_now();
    }

    fn now(&self) -> Deadline {
        Deadline::from_duration(EPOCH.elapsed())
    }
}

static HOST_MEMORY: HostMemory = HostMemory;
static HOST_SCHED: HostSched = HostSched;
static INIT: Once = Once::new();

/// 注册宿主实现，可重复调用
pub fn init() {
    INIT.call_once(|| {
        // SAFETY: Once 保证只注册一次，此前没有任何 futex 操作
        unsafe { register_futex_ops(&HOST_MEMORY, &HOST_SCHED) };
        log::debug!("pi_futex: host runtime registered");
    });
}

/// 以自定义的用户内存实现替换 [`HostMemory`]，用于注入缺页
///
/// 调用时不应有其它线程正在进行 futex 操作。
pub fn init_with_memory(mem: &'static dyn UserMemory) {
    init();
    // SAFETY: 调用者保证此时没有并发的 futex 操作
    unsafe { register_user_memory(mem) };
}

fn install(task: TaskRef) -> TaskRef {
    THREADS.lock().insert(task.tid(), thread::current());
    CURRENT.with(|cur| *cur.borrow_mut() = Some(task.clone()));
    task
}

/// 当前线程绑定的任务，首次调用时以默认优先级创建
pub fn current() -> TaskRef {
    let bound = CURRENT.with(|cur| cur.borrow().clone());
    match bound {
        Some(task) => task,
        None => install(create_task(DEFAULT_PRIO)),
    }
}

/// 为当前线程绑定一个指定优先级的新任务
///
/// 若已绑定任务，旧任务先按退出处理。
pub fn adopt_current(prio: Priority) -> TaskRef {
    init();
    exit_current();
    install(create_task(prio))
}

/// 当前线程的任务退出：执行 futex 退出清理并解除绑定
pub fn exit_current() {
    // 清理期间线程仍绑定着该任务，清理路径查询当前任务时不会另建一个
    let task = CURRENT.with(|cur| cur.borrow().clone());
    if let Some(task) = task {
        futex_exit(&task);
        THREADS.lock().remove(&task.tid());
        CURRENT.with(|cur| cur.borrow_mut().take());
    }
}

/// 在新线程中以指定优先级运行 `f`，返回的任务即该线程的身份
///
/// `f` 返回后线程自动执行退出清理。
pub fn spawn<F, T>(prio: Priority, f: F) -> (TaskRef, JoinHandle<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    init();
    let task = create_task(prio);
    let bound = task.clone();
    let handle = thread::spawn(move || {
        install(bound);
        let ret = f();
        exit_current();
        ret
    });
    (task, handle)
}

/// 从现在起 `timeout` 之后的截止时间
pub fn deadline_after(timeout: Duration) -> Deadline {
    HOST_SCHED.now() + timeout
}
