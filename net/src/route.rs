//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! IPv4 路由表与按端口的路由缓存
//!
//! 参考 Linux 的路由表实现: net/ipv4/route.c, include/net/route.h
//!
//! 路由表项通过 `Arc` 共享：端口缓存持有表项引用，失效判定
//! 用指针同一性比较，删除表项时只清除指向它的缓存

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::ROUTE_TABLE_SIZE;
use crate::device::DeviceTable;
use crate::errno::NetError;
use crate::ipv4::{is_multicast, IP_ADDR_BROADCAST};

/// 路由标志
pub struct RouteFlags;

impl RouteFlags {
    /// 路由可用
    pub const RT_UP: u32 = 0x0001;
    /// 网关路由
    pub const RT_GATEWAY: u32 = 0x0002;
    /// 主机路由
    pub const RT_HOST: u32 = 0x0004;
}

/// 路由表项
///
/// 对应 Linux 的 rtable (include/net/route.h)
pub struct RouteEntry {
    /// 目标网络地址
    pub dst: u32,
    /// 网络掩码
    pub mask: u32,
    /// 网关地址
    pub gateway: u32,
    /// 输出设备索引
    pub dev_index: usize,
    /// 标志（共享表项上的状态用原子量承载）
    flags: AtomicU32,
}

impl RouteEntry {
    pub fn new(dst: u32, mask: u32, gateway: u32, dev_index: usize) -> Self {
        Self {
            dst,
            mask,
            gateway,
            dev_index,
            flags: AtomicU32::new(RouteFlags::RT_UP),
        }
    }

    pub fn is_up(&self) -> bool {
        (self.flags.load(Ordering::Acquire) & RouteFlags::RT_UP) != 0
    }

    pub fn is_gateway(&self) -> bool {
        (self.flags.load(Ordering::Acquire) & RouteFlags::RT_GATEWAY) != 0
    }

    /// 标记路由不可用
    pub fn set_down(&self) {
        self.flags.fetch_and(!RouteFlags::RT_UP, Ordering::Release);
    }

    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::Release);
    }

    /// 检查地址是否匹配此路由
    pub fn matches(&self, addr: u32) -> bool {
        (addr & self.mask) == (self.dst & self.mask)
    }
}

/// 路由表
///
/// 固定大小，最长前缀匹配
pub struct RouteTable {
    entries: [Option<Arc<RouteEntry>>; ROUTE_TABLE_SIZE],
    count: usize,
}

impl RouteTable {
    pub const fn new() -> Self {
        const NONE: Option<Arc<RouteEntry>> = None;
        Self {
            entries: [NONE; ROUTE_TABLE_SIZE],
            count: 0,
        }
    }

    /// 添加路由
    ///
    /// # 参数
    /// - `dst`: 目标网络地址（主机序）
    /// - `mask`: 网络掩码（主机序）
    /// - `gateway`: 网关地址，直连网络填 0
    /// - `dev_index`: 输出设备索引
    ///
    /// # 返回
    /// 新表项的共享引用；表满时返回错误
    pub fn add(
        &mut self,
        dst: u32,
        mask: u32,
        gateway: u32,
        dev_index: usize,
    ) -> Result<Arc<RouteEntry>, NetError> {
        if self.count >= ROUTE_TABLE_SIZE {
            return Err(NetError::InvalidArgument);
        }
        let entry = Arc::new(RouteEntry::new(dst, mask, gateway, dev_index));
        self.entries[self.count] = Some(entry.clone());
        self.count += 1;
        Ok(entry)
    }

    /// 查找路由（最长前缀匹配）
    ///
    /// # 返回
    /// 匹配的可用路由；未找到时返回 `None`
    pub fn lookup(&self, dst: u32) -> Option<Arc<RouteEntry>> {
        let mut best: Option<&Arc<RouteEntry>> = None;
        let mut best_mask = 0u32;

        for entry in self.entries.iter().flatten() {
            if entry.is_up() && entry.matches(dst) && entry.mask >= best_mask {
                best_mask = entry.mask;
                best = Some(entry);
            }
        }
        best.cloned()
    }

    /// 删除路由
    ///
    /// # 返回
    /// 被删除的表项引用，供调用方清除各端口的路由缓存
    pub fn remove(&mut self, dst: u32, mask: u32) -> Option<Arc<RouteEntry>> {
        for i in 0..self.count {
            let hit = self.entries[i]
                .as_ref()
                .is_some_and(|r| r.dst == dst && r.mask == mask);
            if hit {
                let removed = self.entries[i].take();
                for j in i..self.count - 1 {
                    self.entries[j] = self.entries[j + 1].take();
                }
                self.entries[self.count - 1] = None;
                self.count -= 1;
                if let Some(r) = &removed {
                    r.set_down();
                }
                return removed;
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// 套接字侧影响路由选择的参数
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteHints {
    /// 广播默认接口
    pub bcast_if: Option<usize>,
    /// 组播出口接口
    pub mcast_if: Option<usize>,
}

/// 按端口缓存的路由
///
/// 惰性解析，路由删除或设备停用后在下次解析时重建
#[derive(Default)]
pub struct CachedRoute {
    /// 缓存建立时的原始目的地址
    pub ip_dest: u32,
    /// 共享路由表项
    pub route: Option<Arc<RouteEntry>>,
}

impl CachedRoute {
    pub const fn new() -> Self {
        Self { ip_dest: 0, route: None }
    }

    /// 解析目的地址的下一跳，优先复用缓存
    ///
    /// # 参数
    /// - `ip_addr`: 原始目的地址（主机序）
    /// - `hints`: 套接字配置的广播/组播出口
    ///
    /// # 返回
    /// 路由表项引用；无路可走时返回 `RouteUnreachable`
    ///
    /// # 说明
    /// 查找前做目的地址重映射：受限广播映射为出口接口的网络
    /// 广播地址；组播在套接字显式配置了出口接口时映射为该接口
    /// 的网络地址。查找后缓存里存回的是未映射的原始目的地址，
    /// 保证后续的比较正确
    pub fn resolve(
        &mut self,
        ip_addr: u32,
        hints: RouteHints,
        devices: &DeviceTable,
        routes: &RouteTable,
    ) -> Result<Arc<RouteEntry>, NetError> {
        let mut search_addr = ip_addr;

        if ip_addr == IP_ADDR_BROADCAST {
            search_addr = match hints.bcast_if.and_then(|i| devices.get(i)) {
                Some(dev) => dev.net_brdcast,
                None => devices
                    .primary_device()
                    .ok_or(NetError::RouteUnreachable)?
                    .net_brdcast,
            };
            // 默认广播出口可能已经变化，丢弃旧缓存重新查找
            self.route = None;
        } else if is_multicast(search_addr) {
            if let Some(dev) = hints.mcast_if.and_then(|i| devices.get(i)) {
                search_addr = dev.net;
                // 缓存路由的出口与配置的组播接口不一致时作废
                if self
                    .route
                    .as_ref()
                    .is_some_and(|r| r.dev_index != dev.index)
                {
                    self.route = None;
                }
            }
        }

        // 目的地址变化、路由不可用、设备既不 UP 也不 RUNNING：
        // 释放缓存，强制重新查找
        if let Some(rt) = &self.route {
            let dev_ok = devices
                .get(rt.dev_index)
                .map(|d| d.is_up() || d.is_running())
                .unwrap_or(false);
            if self.ip_dest != ip_addr || !rt.is_up() || !dev_ok {
                self.route = None;
            }
        }

        if self.route.is_none() {
            self.route = routes.lookup(search_addr);

            // 组播没有命中任何路由时，退回主接口
            if self.route.is_none() && is_multicast(search_addr) {
                if let Some(dev) = devices.primary_device() {
                    self.route = routes.lookup(dev.net_brdcast);
                }
            }
        }

        // 无论是否重映射过，缓存里都存原始目的地址
        self.ip_dest = ip_addr;

        match self.route.clone() {
            Some(rt) => Ok(rt),
            None => {
                log::debug!("no route to host {:#010x}", ip_addr);
                Err(NetError::RouteUnreachable)
            }
        }
    }

    /// 若缓存指向给定表项则清除
    pub fn drop_if_matches(&mut self, target: &Arc<RouteEntry>) {
        if self
            .route
            .as_ref()
            .is_some_and(|r| Arc::ptr_eq(r, target))
        {
            self.route = None;
        }
    }
}
