//! 编译期配置

use crate::task::{Priority, Tid};

/// 哈希桶数量的位数
pub const FUTEX_HASH_BITS: usize = 8;

/// 哈希桶数量
pub const FUTEX_HASH_SIZE: usize = 1 << FUTEX_HASH_BITS;

/// 最低优先级
///
/// 数值越大优先级越高。
pub const MIN_PRIO: Priority = 0;

/// 最高优先级
pub const MAX_PRIO: Priority = 99;

/// 未指定时的默认优先级
pub const DEFAULT_PRIO: Priority = MIN_PRIO;

/// 第一个可分配的 TID
///
/// 0 在 futex 字中表示“无持有者”，1 保留给初始任务。
pub const FIRST_TID: Tid = 2;

/// 最大可分配的 TID，受 futex 字中 TID 字段宽度限制
pub const MAX_TID: Tid = uapi::futex::FUTEX_TID_MASK;
