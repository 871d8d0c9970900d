//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 协议栈状态码定义
//!
//! 中断上下文只会收到非阻塞的丢弃类状态；任务上下文收到可重试或
//! 可记录的状态码

/// 协议栈错误码
///
/// 使用方法：
/// ```rust,ignore
/// use runet::errno::NetError;
///
/// fn send(len: usize) -> Result<usize, NetError> {
///     if len == 0 {
///         return Err(NetError::InvalidArgument);
///     }
///     Ok(len)
/// }
/// ```
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NetError {
    /// 缓冲区池耗尽（ENOBUFS）
    ///
    /// 永远可恢复：调用方可挂起等待空闲节点回收
    ResourceExhausted = 1,

    /// UDP 校验和不匹配
    ///
    /// 数据报被丢弃并计数，不上报给应用
    ChecksumMismatch = 2,

    /// 没有匹配的端口（目的端口不可达）
    NoMatchingPort = 3,

    /// 参数非法（EINVAL）
    ///
    /// 同步拒绝，保证不产生部分状态修改
    InvalidArgument = 4,

    /// 目的主机不可达（EHOSTUNREACH）
    RouteUnreachable = 5,

    /// 源过滤列表超出上限
    TooManySources = 6,

    /// 套接字加入的组播组数超出上限
    TooManyGroups = 7,

    /// 套接字不是该组播组的成员
    NotAGroupMember = 8,

    /// 接收队列已满，数据报被丢弃
    QueueFull = 9,

    /// 当前没有可读数据（EAGAIN）
    WouldBlock = 10,

    /// 端口表已满或端口已被占用
    PortInUse = 11,

    /// 无效的套接字描述符（EBADF）
    BadSocket = 12,
}

impl NetError {
    /// 转换为系统调用风格的负数错误码
    pub fn as_neg_i32(self) -> i32 {
        -(self as i32)
    }
}
