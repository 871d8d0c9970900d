//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! runet - IPv4 UDP/组播数据报引擎
//!
//! 面向嵌入式协议栈的核心：固定容量的缓冲区池（中断与任务
//! 上下文共享）、带校验和折叠的拷贝引擎、端口匹配与广播/组播
//! 扇出的数据报分发器、组播成员管理、按端口的路由缓存。
//! 其余协议层（IPsec 摘要折叠、SNMP 传输）直接复用这里的
//! 链遍历与校验和原语

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buffer;
pub mod checksum;
pub mod config;
pub mod copy;
pub mod device;
pub mod errno;
pub mod ipv4;
pub mod multicast;
pub mod route;
pub mod stack;
pub mod stats;
pub mod udp;
pub mod wake;

pub use buffer::{BufFlags, BufId, BufferList, BufferNode, BufferPool, SuspendedTask};
pub use checksum::{ip_checksum, ChecksumAcc};
pub use device::{DeviceFlags, DeviceTable, XmitHook};
pub use errno::NetError;
pub use ipv4::Ipv4Meta;
pub use multicast::{FilterMode, GroupReport, MulticastOptions, SocketMembership};
pub use route::{CachedRoute, RouteEntry, RouteHints, RouteTable};
pub use stack::{IgmpHook, NetStack};
pub use stats::NetStats;
pub use udp::{DispatchResult, PortTable, UdpHdr, UdpPort};
pub use wake::{WakeChannel, WakeWorker};
