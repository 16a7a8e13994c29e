//! 类系统调用入口
//!
//! 按 Linux `futex(2)` 的参数约定分发 PI 相关操作，返回值为非负结果或负的错误码。

use uapi::futex::{
    FUTEX_CMP_REQUEUE_PI, FUTEX_LOCK_PI, FUTEX_TRYLOCK_PI, FUTEX_UNLOCK_PI,
    FUTEX_WAIT_REQUEUE_PI, futex_op_split,
};

use crate::error::{FutexError, FutexResult};
use crate::lock::lock_pi;
use crate::ops::Deadline;
use crate::requeue::{cmp_requeue_pi, wait_requeue_pi};
use crate::unlock::unlock_pi;

/// futex 调用参数
///
/// 超时已由调用方换算为单调时钟上的绝对时间；
/// `FUTEX_CMP_REQUEUE_PI` 使用 `val2` 作为迁移数量。
#[derive(Debug, Clone, Copy, Default)]
pub struct FutexArgs {
    /// 第一个 futex 字的地址
    pub uaddr: usize,
    /// 操作码，可与 `FUTEX_PRIVATE_FLAG` 等标志按位或
    pub op: u32,
    /// 期望值或唤醒数量
    pub val: u32,
    /// 迁移数量
    pub val2: u32,
    /// 截止时间，`None` 表示不限时
    pub deadline: Option<Deadline>,
    /// 第二个 futex 字的地址
    pub uaddr2: usize,
    /// 比较值
    pub val3: u32,
}

/// 执行一次 futex 调用
pub fn do_futex(args: &FutexArgs) -> isize {
    match dispatch(args) {
        Ok(n) => n as isize,
        Err(e) => e.to_errno(),
    }
}

fn dispatch(args: &FutexArgs) -> FutexResult<usize> {
    let (cmd, _flags) = futex_op_split(args.op);
    match cmd {
        FUTEX_LOCK_PI => lock_pi(args.uaddr, args.deadline, false).map(|_| 0),
        FUTEX_TRYLOCK_PI => lock_pi(args.uaddr, None, true).map(|_| 0),
        FUTEX_UNLOCK_PI => unlock_pi(args.uaddr).map(|_| 0),
        FUTEX_WAIT_REQUEUE_PI => {
            wait_requeue_pi(args.uaddr, args.val, args.deadline, args.uaddr2).map(|_| 0)
        }
        FUTEX_CMP_REQUEUE_PI => {
            // 只能唤醒一个等待者
            if args.val != 1 {
                return Err(FutexError::InvalidState);
            }
            cmp_requeue_pi(args.uaddr, args.uaddr2, args.val2 as usize, args.val3)
        }
        _ => {
            log::debug!("pi_futex: unsupported futex op {:#x}", args.op);
            Err(FutexError::NotSupported)
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use uapi::errno::{EDEADLK, EINVAL, ENOSYS, EPERM};
    use uapi::futex::{FUTEX_WAIT, FutexOpFlags};

    use super::*;
    use crate::host;

    fn args(uaddr: usize, op: u32) -> FutexArgs {
        FutexArgs {
            uaddr,
            op: op | FutexOpFlags::PRIVATE.bits(),
            ..Default::default()
        }
    }

    #[test]
    fn test_lock_unlock_through_dispatch() {
        host::init();
        let word = AtomicU32::new(0);
        let uaddr = word.as_ptr() as usize;
        let tid = host::current().tid();

        assert_eq!(do_futex(&args(uaddr, FUTEX_LOCK_PI)), 0);
        assert_eq!(word.load(Ordering::Relaxed), tid);
        assert_eq!(
            do_futex(&args(uaddr, FUTEX_TRYLOCK_PI)),
            -(EDEADLK as isize)
        );
        assert_eq!(do_futex(&args(uaddr, FUTEX_UNLOCK_PI)), 0);
        assert_eq!(word.load(Ordering::Relaxed), 0);
        assert_eq!(do_futex(&args(uaddr, FUTEX_UNLOCK_PI)), -(EPERM as isize));
    }

    #[test]
    fn test_cmp_requeue_pi_requires_single_wake() {
        host::init();
        let a = AtomicU32::new(0);
        let b = AtomicU32::new(0);
        let mut req = args(a.as_ptr() as usize, FUTEX_CMP_REQUEUE_PI);
        req.uaddr2 = b.as_ptr() as usize;
        req.val = 2;
        assert_eq!(do_futex(&req), -(EINVAL as isize));
        req.val = 1;
        assert_eq!(do_futex(&req), 0);
    }

    #[test]
    fn test_unsupported_op() {
        host::init();
        let word = AtomicU32::new(0);
        assert_eq!(
            do_futex(&args(word.as_ptr() as usize, FUTEX_WAIT)),
            -(ENOSYS as isize)
        );
    }
}
