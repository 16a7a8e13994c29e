//! futex key
//!
//! 同一地址空间中的同一个用户地址映射到同一个 key，
//! key 决定等待者挂在哪个哈希桶上，也是 PiState 与 futex 字之间的关联。

use crate::error::{FutexError, FutexResult};
use crate::ops::user_memory;

/// 标识一个 futex 字
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FutexKey {
    space: usize,
    offset: usize,
}

impl FutexKey {
    /// 私有 futex：地址空间标识加用户地址
    pub const fn private(space: usize, uaddr: usize) -> Self {
        Self {
            space,
            offset: uaddr,
        }
    }

    /// 用户地址
    pub const fn uaddr(&self) -> usize {
        self.offset
    }
}

/// 为当前地址空间中的 `uaddr` 生成 key
///
/// 地址必须非空且 4 字节对齐。
pub fn get_futex_key(uaddr: usize) -> FutexResult<FutexKey> {
    if uaddr % core::mem::align_of::<u32>() != 0 {
        return Err(FutexError::InvalidState);
    }
    if uaddr == 0 {
        return Err(FutexError::Fault);
    }
    Ok(FutexKey::private(user_memory().address_space(), uaddr))
}
