//! 与用户空间共用定义和声明
//!
//! 包含 futex 字的位布局、futex 操作码以及错误码，
//! 确保库内部与用户空间看到的二进制格式一致。

#![no_std]
#![allow(dead_code)]
// uapi 中包含大量与 Linux 兼容的常量定义；逐项补 `///` 噪声较大。
#![allow(missing_docs)]

pub mod errno;
pub mod futex;
