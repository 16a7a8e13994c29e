//! 缺页注入
//!
//! 对指定地址预先安排若干次 cmpxchg 缺页，并记录 fault-in 的调用；
//! 也可以让某个地址的 fault-in 失败，模拟无法修复的映射，
//! 或者在下一次 cmpxchg 之前插入一次并发写入。

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 缺页注入计划，可放在 `static` 中在多个线程间共享
#[derive(Debug, Default)]
pub struct FaultPlan {
    /// (地址, 剩余缺页次数)
    armed: Mutex<Vec<(usize, usize)>>,
    /// fault-in 会失败的地址
    unfixable: Mutex<Vec<usize>>,
    /// (地址, 下一次 cmpxchg 前被别人置上的位)
    races: Mutex<Vec<(usize, u32)>>,
    fault_ins: AtomicUsize,
}

impl FaultPlan {
    /// 创建空计划
    pub const fn new() -> Self {
        Self {
            armed: Mutex::new(Vec::new()),
            unfixable: Mutex::new(Vec::new()),
            races: Mutex::new(Vec::new()),
            fault_ins: AtomicUsize::new(0),
        }
    }

    /// 让 `uaddr` 上接下来的 `times` 次 cmpxchg 缺页
    pub fn arm_cmpxchg(&self, uaddr: usize, times: usize) {
        let mut armed = self.armed.lock().unwrap();
        match armed.iter_mut().find(|(addr, _)| *addr == uaddr) {
            Some(entry) => entry.1 += times,
            None => armed.push((uaddr, times)),
        }
    }

    /// 消耗一次预定的缺页，返回本次 cmpxchg 是否应当缺页
    pub fn take_cmpxchg_fault(&self, uaddr: usize) -> bool {
        let mut armed = self.armed.lock().unwrap();
        let Some(pos) = armed.iter().position(|(addr, _)| *addr == uaddr) else {
            return false;
        };
        armed[pos].1 -= 1;
        if armed[pos].1 == 0 {
            armed.swap_remove(pos);
        }
        true
    }

    /// 还有多少次预定缺页未被消耗
    pub fn pending(&self, uaddr: usize) -> usize {
        self.armed
            .lock()
            .unwrap()
            .iter()
            .find(|(addr, _)| *addr == uaddr)
            .map_or(0, |(_, n)| *n)
    }

    /// 记录一次对 `uaddr` 的 fault-in，返回它是否应当成功
    pub fn record_fault_in(&self, uaddr: usize) -> bool {
        self.fault_ins.fetch_add(1, Ordering::SeqCst);
        !self.unfixable.lock().unwrap().contains(&uaddr)
    }

    /// 迄今 fault-in 的次数
    pub fn fault_in_count(&self) -> usize {
        self.fault_ins.load(Ordering::SeqCst)
    }

    /// 让 `uaddr` 的 fault-in 一律失败
    pub fn make_unfixable(&self, uaddr: usize) {
        self.unfixable.lock().unwrap().push(uaddr);
    }

    /// 让 `uaddr` 上的下一次 cmpxchg 之前，先有另一方置上 `bits`
    pub fn race_cmpxchg(&self, uaddr: usize, bits: u32) {
        self.races.lock().unwrap().push((uaddr, bits));
    }

    /// 取出预定在这次 cmpxchg 之前发生的写入
    pub fn take_race(&self, uaddr: usize) -> Option<u32> {
        let mut races = self.races.lock().unwrap();
        let pos = races.iter().position(|(addr, _)| *addr == uaddr)?;
        Some(races.remove(pos).1)
    }

    /// 清空所有安排
    pub fn reset(&self) {
        self.armed.lock().unwrap().clear();
        self.unfixable.lock().unwrap().clear();
        self.races.lock().unwrap().clear();
        self.fault_ins.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_armed_faults_are_consumed() {
        let plan = FaultPlan::new();
        plan.arm_cmpxchg(0x40, 2);
        assert!(!plan.take_cmpxchg_fault(0x44));
        assert!(plan.take_cmpxchg_fault(0x40));
        assert_eq!(plan.pending(0x40), 1);
        assert!(plan.take_cmpxchg_fault(0x40));
        assert!(!plan.take_cmpxchg_fault(0x40));
    }

    #[test]
    fn test_fault_in_switch() {
        let plan = FaultPlan::new();
        assert!(plan.record_fault_in(0x40));
        plan.make_unfixable(0x40);
        assert!(!plan.record_fault_in(0x40));
        assert!(plan.record_fault_in(0x44));
        assert_eq!(plan.fault_in_count(), 3);
    }

    #[test]
    fn test_race_fires_once() {
        let plan = FaultPlan::new();
        plan.race_cmpxchg(0x40, 0x8000_0000);
        assert_eq!(plan.take_race(0x44), None);
        assert_eq!(plan.take_race(0x40), Some(0x8000_0000));
        assert_eq!(plan.take_race(0x40), None);
    }
}
