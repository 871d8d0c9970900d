//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 协议栈统计计数器
//!
//! 参考 MIB-II (RFC 1213) 的 UDP / IP 计数器命名

use core::sync::atomic::{AtomicU32, Ordering};

/// 协议栈统计信息
///
/// 所有计数器使用原子递增，读写不需要额外的锁
#[derive(Debug, Default)]
pub struct NetStats {
    /// 成功递交的 UDP 数据报数
    pub udp_in_datagrams: AtomicU32,
    /// 发出的 UDP 数据报数
    pub udp_out_datagrams: AtomicU32,
    /// 因校验和错误或接收队列溢出而丢弃的入站数据报数
    pub udp_in_errors: AtomicU32,
    /// 没有匹配端口的入站数据报数
    pub udp_no_ports: AtomicU32,
    /// 因组播源过滤被拒绝的入站数据报数
    pub ip_in_addr_errors: AtomicU32,
}

impl NetStats {
    pub const fn new() -> Self {
        Self {
            udp_in_datagrams: AtomicU32::new(0),
            udp_out_datagrams: AtomicU32::new(0),
            udp_in_errors: AtomicU32::new(0),
            udp_no_ports: AtomicU32::new(0),
            ip_in_addr_errors: AtomicU32::new(0),
        }
    }

    pub fn inc(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = NetStats::new();
        NetStats::inc(&stats.udp_no_ports);
        NetStats::inc(&stats.udp_no_ports);
        assert_eq!(NetStats::get(&stats.udp_no_ports), 2);
        assert_eq!(NetStats::get(&stats.udp_in_errors), 0);
    }
}
