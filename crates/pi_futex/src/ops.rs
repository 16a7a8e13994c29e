//! 运行时操作 trait 定义和注册
//!
//! futex 核心不直接访问用户内存，也不知道任务如何睡眠与唤醒。
//! 宿主实现 [`UserMemory`] 与 [`SchedOps`] 并在启动时注册。

use core::ops::Add;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use crate::error::FutexResult;
use crate::task::TaskRef;

/// 单调时钟上的绝对时间点
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Duration);

impl Deadline {
    /// 从单调时钟起点开始计算的时间点
    pub const fn from_duration(since_boot: Duration) -> Self {
        Self(since_boot)
    }

    /// 距离时钟起点的时长
    pub const fn as_duration(&self) -> Duration {
        self.0
    }

    /// 距离 `earlier` 还剩多久，已过期则为 0
    pub fn saturating_since(&self, earlier: Deadline) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Deadline {
    type Output = Deadline;

    fn add(self, rhs: Duration) -> Deadline {
        Deadline(self.0.saturating_add(rhs))
    }
}

/// 用户内存访问
///
/// 所有方法都可能在持有自旋锁时被调用（`fault_in_writeable` 除外），
/// 因此实现不得阻塞；遇到不可访问的地址时返回 [`FutexError::Fault`]。
///
/// [`FutexError::Fault`]: crate::FutexError::Fault
pub trait UserMemory: Send + Sync {
    /// 读取 futex 字
    fn read_u32(&self, uaddr: usize) -> FutexResult<u32>;

    /// 原子比较交换
    ///
    /// 返回交换前观测到的值；与 `expected` 相等即表示交换成功。
    fn cmpxchg_u32(&self, uaddr: usize, expected: u32, new: u32) -> FutexResult<u32>;

    /// 使地址可写
    ///
    /// 可能阻塞，调用者必须先释放所有自旋锁。
    fn fault_in_writeable(&self, uaddr: usize) -> FutexResult<()>;

    /// 当前地址空间的标识，用于构造私有 futex 的 key
    fn address_space(&self) -> usize {
        0
    }
}

/// 调度操作
pub trait SchedOps: Send + Sync {
    /// 当前正在运行的任务
    fn current_task(&self) -> TaskRef;

    /// 使当前任务睡眠，直到被 [`SchedOps::wake`] 唤醒或到达截止时间
    ///
    /// `task` 必须是当前任务。允许伪唤醒：调用者总会重新检查等待条件。
    /// 若在 `block` 之前已有针对该任务的 `wake`，本次 `block` 应立即返回。
    fn block(&self, task: &TaskRef, deadline: Option<Deadline>);

    /// 唤醒任务
    fn wake(&self, task: &TaskRef);

    /// 让出处理器，用于瞬态竞争后的重试
    fn yield_now(&self);

    /// 当前时间
    fn now(&self) -> Deadline;
}

// ========== UserMemory 注册 ==========

static USER_MEMORY_DATA: AtomicUsize = AtomicUsize::new(0);
static USER_MEMORY_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册用户内存访问实现
///
/// # Safety
/// 必须在任何 futex 操作之前调用；重复注册时，
/// 调用者需保证没有并发的 futex 操作正在使用旧实现
pub unsafe fn register_user_memory(ops: &'static dyn UserMemory) {
    let ptr = ops as *const dyn UserMemory;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn UserMemory, (usize, usize)>(ptr) };
    USER_MEMORY_VTABLE.store(vtable, Ordering::Release);
    USER_MEMORY_DATA.store(data, Ordering::Release);
}

/// 获取已注册的用户内存访问实现
///
/// # Panics
/// 如果尚未调用 [`register_user_memory`] 注册实现，则 panic
#[inline]
pub fn user_memory() -> &'static dyn UserMemory {
    let data = USER_MEMORY_DATA.load(Ordering::Acquire);
    let vtable = USER_MEMORY_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("pi_futex: UserMemory not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn UserMemory>((data, vtable)) }
}

// ========== SchedOps 注册 ==========

static SCHED_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static SCHED_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册调度操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_sched_ops(ops: &'static dyn SchedOps) {
    let ptr = ops as *const dyn SchedOps;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn SchedOps, (usize, usize)>(ptr) };
    SCHED_OPS_VTABLE.store(vtable, Ordering::Release);
    SCHED_OPS_DATA.store(data, Ordering::Release);
}

/// 获取已注册的调度操作实现
///
/// # Panics
/// 如果尚未调用 [`register_sched_ops`] 注册实现，则 panic
#[inline]
pub fn sched_ops() -> &'static dyn SchedOps {
    let data = SCHED_OPS_DATA.load(Ordering::Acquire);
    let vtable = SCHED_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("pi_futex: SchedOps not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn SchedOps>((data, vtable)) }
}

/// 同时注册两类运行时操作
///
/// # Safety
/// 同 [`register_user_memory`] 与 [`register_sched_ops`]
pub unsafe fn register_futex_ops(mem: &'static dyn UserMemory, sched: &'static dyn SchedOps) {
    // SAFETY: 由调用者保证
    unsafe {
        register_user_memory(mem);
        register_sched_ops(sched);
    }
}

/// 读取 futex 字，缺页时先调入再重试
pub(crate) fn get_user(uaddr: usize) -> FutexResult<u32> {
    let mem = user_memory();
    loop {
        match mem.read_u32(uaddr) {
            Err(crate::FutexError::Fault) => mem.fault_in_writeable(uaddr)?,
            res => return res,
        }
    }
}
