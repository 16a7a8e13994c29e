//! 测试支持 crate
//!
//! 提供缺页注入计划、按线程统计的计数分配器和轮询等待工具。
//!
//! 注意：这里不直接依赖 `pi_futex`（避免循环依赖）。
//! 集成测试把 [`FaultPlan`] 包装成自己的 `UserMemory` 实现。

pub mod counting;
pub mod fault;

pub use counting::{CountingAllocator, count_allocations, thread_allocations};
pub use fault::FaultPlan;

use std::time::{Duration, Instant};

/// 轮询直到 `cond` 成立或超时，返回最终是否成立
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
