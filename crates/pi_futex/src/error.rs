//! futex 错误类型
//!
//! 可通过 [`FutexError::to_errno()`] 转换为系统调用错误码。

use core::fmt;

use uapi::errno::*;

/// futex 操作的错误类型
///
/// `TryAgain` 与 `Fault` 属于内部可重试的瞬态错误，
/// 公开的加解锁操作会自行重试，只有在缺页无法修复时才会向外返回 `Fault`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexError {
    /// futex 字与内核侧状态不一致，或参数非法 (-EINVAL)
    InvalidState,
    /// 瞬态竞争，应当重试 (-EAGAIN)
    TryAgain,
    /// 调用者已经持有该锁 (-EDEADLK)
    Deadlock,
    /// 解锁者不是持有者，或目标任务不可作为 PI 持有者 (-EPERM)
    PermissionDenied,
    /// futex 字中的 TID 找不到对应任务 (-ESRCH)
    NoSuchProcess,
    /// 用户内存不可访问 (-EFAULT)
    Fault,
    /// 超时 (-ETIMEDOUT)
    TimedOut,
    /// 等待被中断 (-EINTR)
    Interrupted,
    /// 非阻塞尝试失败，或 futex 值已改变 (-EWOULDBLOCK)
    WouldBlock,
    /// 不支持的操作 (-ENOSYS)
    NotSupported,
}

/// futex 操作的结果类型
pub type FutexResult<T> = Result<T, FutexError>;

impl FutexError {
    /// 转换为系统调用错误码（负数）
    pub fn to_errno(&self) -> isize {
        let errno = match self {
            FutexError::InvalidState => EINVAL,
            FutexError::TryAgain => EAGAIN,
            FutexError::Deadlock => EDEADLK,
            FutexError::PermissionDenied => EPERM,
            FutexError::NoSuchProcess => ESRCH,
            FutexError::Fault => EFAULT,
            FutexError::TimedOut => ETIMEDOUT,
            FutexError::Interrupted => EINTR,
            FutexError::WouldBlock => EWOULDBLOCK,
            FutexError::NotSupported => ENOSYS,
        };
        -(errno as isize)
    }
}

impl fmt::Display for FutexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FutexError::InvalidState => "inconsistent futex state",
            FutexError::TryAgain => "transient race, try again",
            FutexError::Deadlock => "lock already held by caller",
            FutexError::PermissionDenied => "operation not permitted",
            FutexError::NoSuchProcess => "owner task does not exist",
            FutexError::Fault => "bad user address",
            FutexError::TimedOut => "timed out",
            FutexError::Interrupted => "interrupted",
            FutexError::WouldBlock => "operation would block",
            FutexError::NotSupported => "operation not supported",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FutexError::InvalidState.to_errno(), -22);
        assert_eq!(FutexError::Deadlock.to_errno(), -35);
        assert_eq!(FutexError::NoSuchProcess.to_errno(), -3);
        assert_eq!(FutexError::TimedOut.to_errno(), -110);
        // 两者在 Linux 上是同一个值
        assert_eq!(
            FutexError::WouldBlock.to_errno(),
            FutexError::TryAgain.to_errno()
        );
    }
}
