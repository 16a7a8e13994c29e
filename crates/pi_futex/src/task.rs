//! 任务与任务注册表
//!
//! 这里的任务只保存 futex 关心的那部分状态：
//! TID、优先级、退出状态、持有的 PiState 列表以及 robust futex 列表。
//! 注册表负责 TID 到任务的查找，用于解析 futex 字中的持有者。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use hashbrown::HashMap;
use sync::{SpinLock, SpinLockGuard};

use crate::config::{FIRST_TID, MAX_PRIO, MAX_TID};
use crate::ops::sched_ops;
use crate::pi_state::PiStateRef;

/// 任务 ID
pub type Tid = u32;

/// 调度优先级，数值越大越优先
pub type Priority = u8;

/// 任务的共享引用
pub type TaskRef = Arc<Task>;

/// 任务的退出状态
///
/// 附着 PiState 时据此判断持有者能否接收新的 PiState。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// 正常运行
    Alive,
    /// 正在退出，PiState 清理尚未完成
    ExitingCleanupPending,
    /// 退出清理已完成
    ExitingCleanupDone,
    /// 内核线程等不可作为 PI 持有者的任务
    Ineligible,
}

/// 受 pi_lock 保护的部分
pub(crate) struct TaskPi {
    pub(crate) state: TaskState,
    /// 该任务作为持有者的所有 PiState，不计入 PiState 的协议引用计数
    pub(crate) pi_state_list: Vec<PiStateRef>,
    /// (RtMutex id, 最高等待者优先级)
    boosts: Vec<(u64, Priority)>,
}

impl TaskPi {
    pub(crate) fn list_add(&mut self, pi_state: PiStateRef) {
        self.pi_state_list.push(pi_state);
    }

    pub(crate) fn list_del(&mut self, pi_state: &PiStateRef) -> bool {
        match self
            .pi_state_list
            .iter()
            .position(|p| Arc::ptr_eq(p, pi_state))
        {
            Some(idx) => {
                self.pi_state_list.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn list_head(&self) -> Option<&PiStateRef> {
        self.pi_state_list.first()
    }
}

/// 参与 futex 的任务
pub struct Task {
    tid: Tid,
    base_prio: Priority,
    pi: SpinLock<TaskPi>,
    /// 预分配的 PiState，保证持锁路径上无需分配
    pi_state_cache: SpinLock<Option<PiStateRef>>,
    /// 待处理的中断请求
    signal: AtomicBool,
    /// 当前持有的 robust futex 地址
    robust_list: SpinLock<Vec<usize>>,
}

impl Task {
    fn new(tid: Tid, base_prio: Priority, state: TaskState) -> Self {
        Self {
            tid,
            base_prio: base_prio.min(MAX_PRIO),
            pi: SpinLock::new(TaskPi {
                state,
                pi_state_list: Vec::new(),
                boosts: Vec::new(),
            }),
            pi_state_cache: SpinLock::new(None),
            signal: AtomicBool::new(false),
            robust_list: SpinLock::new(Vec::new()),
        }
    }

    /// 任务 ID
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// 基础优先级
    pub fn base_prio(&self) -> Priority {
        self.base_prio
    }

    /// 考虑优先级继承后的有效优先级
    pub fn effective_prio(&self) -> Priority {
        let pi = self.pi.lock();
        pi.boosts
            .iter()
            .map(|&(_, prio)| prio)
            .fold(self.base_prio, Priority::max)
    }

    /// 退出状态
    pub fn state(&self) -> TaskState {
        self.pi.lock().state
    }

    /// 作为持有者挂在该任务上的 PiState 数量
    pub fn pi_state_count(&self) -> usize {
        self.pi.lock().pi_state_list.len()
    }

    /// 请求中断该任务的阻塞等待
    ///
    /// 正在等待 PI 锁的任务会以 [`FutexError::Interrupted`] 返回。
    ///
    /// [`FutexError::Interrupted`]: crate::FutexError::Interrupted
    pub fn interrupt(self: &Arc<Self>) {
        self.signal.store(true, Ordering::Release);
        sched_ops().wake(self);
    }

    pub(crate) fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::Acquire)
    }

    pub(crate) fn take_signal(&self) -> bool {
        self.signal.swap(false, Ordering::AcqRel)
    }

    /// 登记一个由该任务持有的 robust futex
    pub fn robust_register(&self, uaddr: usize) {
        let mut list = self.robust_list.lock();
        if !list.contains(&uaddr) {
            list.push(uaddr);
        }
    }

    /// 取消登记
    pub fn robust_unregister(&self, uaddr: usize) {
        self.robust_list.lock().retain(|&a| a != uaddr);
    }

    pub(crate) fn take_robust_list(&self) -> Vec<usize> {
        core::mem::take(&mut *self.robust_list.lock())
    }

    pub(crate) fn pi_lock(&self) -> SpinLockGuard<'_, TaskPi> {
        self.pi.lock()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.pi.lock().state = state;
    }

    /// 更新某个 RtMutex 对该任务的优先级提升，`None` 表示撤销
    pub(crate) fn set_boost(&self, mutex_id: u64, prio: Option<Priority>) {
        let mut pi = self.pi.lock();
        let pos = pi.boosts.iter().position(|&(id, _)| id == mutex_id);
        match (pos, prio) {
            (Some(idx), Some(prio)) => pi.boosts[idx].1 = prio,
            (Some(idx), None) => {
                pi.boosts.swap_remove(idx);
            }
            (None, Some(prio)) => pi.boosts.push((mutex_id, prio)),
            (None, None) => {}
        }
    }

    pub(crate) fn pi_state_cache(&self) -> SpinLockGuard<'_, Option<PiStateRef>> {
        self.pi_state_cache.lock()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("tid", &self.tid)
            .field("base_prio", &self.base_prio)
            .finish()
    }
}

/// 两个引用是否指向同一个任务
#[inline]
pub(crate) fn same_task(a: &Task, b: &Task) -> bool {
    core::ptr::eq(a, b)
}

/// 简单的任务ID分配器。
/// 任务ID从 [`FIRST_TID`] 开始递增（TID 1 保留给初始任务）。
#[derive(Debug)]
struct TidAllocator {
    next_tid: AtomicU32,
}

impl TidAllocator {
    const fn new() -> Self {
        TidAllocator {
            next_tid: AtomicU32::new(FIRST_TID),
        }
    }

    fn allocate(&self) -> Tid {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        assert!(tid <= MAX_TID, "pi_futex: TID space exhausted");
        tid
    }
}

static TID_ALLOCATOR: TidAllocator = TidAllocator::new();

lazy_static::lazy_static! {
    /// TID 到任务的映射
    static ref TASK_REGISTRY: SpinLock<HashMap<Tid, TaskRef>> = SpinLock::new(HashMap::new());
}

fn spawn_task(prio: Priority, state: TaskState) -> TaskRef {
    let task = Arc::new(Task::new(TID_ALLOCATOR.allocate(), prio, state));
    TASK_REGISTRY.lock().insert(task.tid, task.clone());
    task
}

/// 创建并登记一个普通任务
pub fn create_task(prio: Priority) -> TaskRef {
    spawn_task(prio, TaskState::Alive)
}

/// 创建并登记一个不能作为 PI 持有者的任务
pub fn create_kernel_task() -> TaskRef {
    spawn_task(MAX_PRIO, TaskState::Ineligible)
}

/// 按 TID 查找任务
pub fn find_task(tid: Tid) -> Option<TaskRef> {
    TASK_REGISTRY.lock().get(&tid).cloned()
}

pub(crate) fn unregister_task(tid: Tid) {
    TASK_REGISTRY.lock().remove(&tid);
}

/// 延迟唤醒队列
///
/// 在持锁期间收集需要唤醒的任务，释放所有锁之后再统一唤醒。
pub(crate) struct WakeQ {
    tasks: Vec<TaskRef>,
}

impl WakeQ {
    pub(crate) const fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub(crate) fn add(&mut self, task: TaskRef) {
        if !self.tasks.iter().any(|t| same_task(t, &task)) {
            self.tasks.push(task);
        }
    }

    pub(crate) fn wake_up(self) {
        let sched = sched_ops();
        for task in self.tasks {
            sched.wake(&task);
        }
    }
}
