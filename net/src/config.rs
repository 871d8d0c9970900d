//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 网络协议栈配置
//!
//! 所有表大小、缓冲区几何参数和协议默认值集中在此处

// ============================================================
// 缓冲区池配置
// ============================================================

/// 单个缓冲区节点的数据区大小（字节）
pub const NET_BUFFER_SIZE: usize = 128;

/// 缓冲区池默认容量（节点数）
pub const NET_POOL_CAPACITY: usize = 128;

/// 空闲链表低水位线
///
/// 空闲节点数回升到该值时，唤醒挂起队列头部的任务
pub const NET_FREE_LOW_WATER: usize = 4;

/// 延迟唤醒队列深度
pub const NET_WAKE_QUEUE_SIZE: usize = 16;

// ============================================================
// UDP 配置
// ============================================================

/// UDP 端口表大小
pub const UDP_MAX_PORTS: usize = 64;

/// 单个端口接收队列中缓存的最大数据报数
pub const UDP_MAX_DGRAMS: u16 = 8;

/// UDP 最大数据报载荷长度
pub const UDP_MAX_DATAGRAM: usize = 65507;

// ============================================================
// 组播配置
// ============================================================

/// 每个套接字可加入的最大组播组数
pub const IP_MAX_MEMBERSHIPS: usize = 10;

/// 每条成员关系中源过滤列表的最大长度
pub const MAX_MULTICAST_SRC_ADDR: usize = 16;

/// 每个设备可维护的最大组播组状态数
pub const DEV_MAX_GROUPS: usize = 16;

/// 组播默认 TTL
pub const IP_DEFAULT_MULTICAST_TTL: u8 = 1;

// ============================================================
// 路由 / 设备配置
// ============================================================

/// 路由表大小
pub const ROUTE_TABLE_SIZE: usize = 64;

/// 设备表大小
pub const DEV_TABLE_SIZE: usize = 8;

/// IPv4 默认 TTL
pub const IP_DEFAULT_TTL: u8 = 64;

/// 设备名最大长度
pub const IFNAMSIZ: usize = 16;
