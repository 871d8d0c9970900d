//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! UDP 协议
//!
//! 参考 Linux 内核的 UDP 实现: net/ipv4/udp.c, include/net/udp.h
//!
//! 入站数据报的分发规则：
//! 1. 除非硬件已经验证，先验证校验和；发送方填零的校验和无条件
//!    接受；校验失败把链还给缓冲区池并计数，不算致命错误
//! 2. 按下标顺序扫描端口表；广播给每个匹配端口递交一份副本，
//!    不提前退出；第一个精确四元组匹配立刻短路，独占原始链；
//!    地址复用下的通配匹配只记下标（后者覆盖前者），扫描证明
//!    没有精确匹配后才使用；组播递交前先过成员关系的源过滤
//! 3. 没有任何匹配时计数并报告端口不可达，本层不发 ICMP

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::buffer::{BufFlags, BufId, BufferList, BufferPool, SuspendedTask};
use crate::checksum::pseudo_header_sum;
use crate::config::{UDP_MAX_DATAGRAM, UDP_MAX_DGRAMS, UDP_MAX_PORTS};
use crate::errno::NetError;
use crate::ipv4::{is_multicast, Ipv4Meta, IP_ADDR_ANY, IP_ADDR_BROADCAST, IP_PROTO_UDP};
use crate::multicast::{MulticastOptions, SocketMembership};
use crate::route::{CachedRoute, RouteEntry, RouteHints};
use crate::stack::NetStack;
use crate::stats::NetStats;

/// UDP 头部长度
pub const UDP_HEADER_LEN: usize = 8;

/// 源端口在头部中的偏移
pub const UDP_SRC_OFFSET: usize = 0;
/// 目的端口偏移
pub const UDP_DEST_OFFSET: usize = 2;
/// 长度字段偏移
pub const UDP_LENGTH_OFFSET: usize = 4;
/// 校验和字段偏移
pub const UDP_CHECK_OFFSET: usize = 6;

/// UDP 头部
///
/// 对应 Linux 的 udphdr (include/uapi/linux/udp.h)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpHdr {
    /// 源端口
    pub source: u16,
    /// 目的端口
    pub dest: u16,
    /// 长度（头部 + 数据）
    pub len: u16,
    /// 校验和
    pub check: u16,
}

impl UdpHdr {
    /// 从链首节点的窗口解析 UDP 头部
    pub fn parse(pool: &BufferPool, head: BufId) -> Option<Self> {
        if (pool.node(head).data_len as usize) < UDP_HEADER_LEN {
            return None;
        }
        Some(Self {
            source: pool.get16(head, UDP_SRC_OFFSET),
            dest: pool.get16(head, UDP_DEST_OFFSET),
            len: pool.get16(head, UDP_LENGTH_OFFSET),
            check: pool.get16(head, UDP_CHECK_OFFSET),
        })
    }
}

/// 数据报分发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// 已递交到至少一个端口
    Delivered,
    /// 没有匹配的端口；调用方可据此生成端口不可达 ICMP
    NoPort,
    /// 校验和错误，链已被回收
    ChecksumError,
    /// 主机不可达（发送路径的路由解析失败）
    HostUnreachable,
}

/// UDP 端口（套接字绑定）
pub struct UdpPort {
    /// 本地端口
    pub lport: u16,
    /// 远端端口
    pub fport: u16,
    /// 本地地址（主机序）
    pub laddr: u32,
    /// 远端地址（主机序）
    pub faddr: u32,
    /// 是否已连接（精确四元组匹配）
    pub connected: bool,
    /// 地址复用
    pub reuse_addr: bool,
    /// 单播 TTL
    pub ttl: u8,
    /// 广播默认出口接口
    pub bcast_if: Option<usize>,
    /// 组播选项
    pub moptions: Option<Box<MulticastOptions>>,
    /// 接收队列
    pub recvlist: BufferList,
    /// 接收队列中的数据报数
    pub recvpackets: u16,
    /// 接收队列中的字节数
    pub recvbytes: u32,
    /// 等待收包的任务（FIFO）
    pub rx_waiters: VecDeque<Arc<dyn SuspendedTask>>,
    /// 缓存路由
    pub route: CachedRoute,
}

impl UdpPort {
    pub fn new() -> Self {
        Self {
            lport: 0,
            fport: 0,
            laddr: IP_ADDR_ANY,
            faddr: IP_ADDR_ANY,
            connected: false,
            reuse_addr: false,
            ttl: crate::config::IP_DEFAULT_TTL,
            bcast_if: None,
            moptions: None,
            recvlist: BufferList::new(),
            recvpackets: 0,
            recvbytes: 0,
            rx_waiters: VecDeque::new(),
            route: CachedRoute::new(),
        }
    }

    /// 绑定本地地址和端口
    pub fn bind(&mut self, addr: u32, port: u16) {
        self.laddr = addr;
        self.lport = port;
    }

    /// 连接到远端地址
    pub fn connect(&mut self, addr: u32, port: u16) {
        self.faddr = addr;
        self.fport = port;
        self.connected = true;
    }

    pub fn disconnect(&mut self) {
        self.faddr = IP_ADDR_ANY;
        self.fport = 0;
        self.connected = false;
    }
}

impl Default for UdpPort {
    fn default() -> Self {
        Self::new()
    }
}

/// UDP 端口表
///
/// 固定大小的有界注册表；扫描按下标顺序，广播递交顺序因此稳定
pub struct PortTable {
    ports: [Option<Box<UdpPort>>; UDP_MAX_PORTS],
}

impl PortTable {
    pub const fn new() -> Self {
        const NONE: Option<Box<UdpPort>> = None;
        Self { ports: [NONE; UDP_MAX_PORTS] }
    }

    /// 分配一个空闲端口槽
    pub fn alloc(&mut self) -> Result<usize, NetError> {
        for (i, slot) in self.ports.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Box::new(UdpPort::new()));
                return Ok(i);
            }
        }
        Err(NetError::PortInUse)
    }

    /// 摘除端口槽
    ///
    /// 接收队列中残留的缓冲区链由调用方归还池
    pub fn take(&mut self, index: usize) -> Option<Box<UdpPort>> {
        self.ports.get_mut(index)?.take()
    }

    pub fn get(&self, index: usize) -> Option<&UdpPort> {
        self.ports.get(index)?.as_deref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut UdpPort> {
        self.ports.get_mut(index)?.as_deref_mut()
    }

    /// 收集所有套接字在（接口，组）上的成员关系快照
    pub fn collect_memberships(&self, dev_index: usize, group: u32) -> Vec<SocketMembership> {
        let mut out = Vec::new();
        for port in self.ports.iter().flatten() {
            if let Some(mopt) = &port.moptions {
                if let Some(m) = mopt.membership(dev_index, group) {
                    out.push(*m);
                }
            }
        }
        out
    }

    /// 清除所有指向被删除路由的端口缓存
    ///
    /// 只动指向该表项的缓存，其余端口的缓存路由不受影响
    pub fn free_cached_routes(&mut self, target: &Arc<RouteEntry>) {
        for port in self.ports.iter_mut().flatten() {
            port.route.drop_if_matches(target);
        }
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

/// 端口扫描对单个端口作出的递交决策
enum ScanAction {
    DeliverCopy,
    DeliverOriginal,
    Save,
    Refuse,
}

impl NetStack {
    /// 打开一个 UDP 套接字
    pub fn udp_open(&mut self) -> Result<usize, NetError> {
        self.ports.alloc()
    }

    /// 绑定本地地址和端口
    ///
    /// 同一（地址，端口）组合已被占用且双方都未开地址复用时拒绝
    pub fn udp_bind(&mut self, socketd: usize, addr: u32, port: u16) -> Result<(), NetError> {
        if port == 0 {
            return Err(NetError::InvalidArgument);
        }
        let reuse = self
            .ports
            .get(socketd)
            .ok_or(NetError::BadSocket)?
            .reuse_addr;
        for i in 0..UDP_MAX_PORTS {
            if i == socketd {
                continue;
            }
            if let Some(other) = self.ports.get(i) {
                if other.lport == port && other.laddr == addr && !(reuse && other.reuse_addr) {
                    return Err(NetError::PortInUse);
                }
            }
        }
        self.ports
            .get_mut(socketd)
            .ok_or(NetError::BadSocket)?
            .bind(addr, port);
        Ok(())
    }

    /// 连接到远端地址（精确四元组接收）
    pub fn udp_connect(
        &mut self,
        socketd: usize,
        addr: u32,
        port: u16,
    ) -> Result<(), NetError> {
        self.ports
            .get_mut(socketd)
            .ok_or(NetError::BadSocket)?
            .connect(addr, port);
        Ok(())
    }

    /// 关闭套接字
    ///
    /// 归还接收队列里的缓冲区链，退出所有组播组并重算设备聚合，
    /// 释放缓存路由
    pub fn udp_close(&mut self, socketd: usize) -> Result<(), NetError> {
        let mut port = self.ports.take(socketd).ok_or(NetError::BadSocket)?;

        {
            let mut pool = self.pool.lock();
            while let Some(head) = pool.dequeue(&mut port.recvlist) {
                pool.free_mixed_chain(head);
            }
        }

        if let Some(mopt) = &port.moptions {
            let groups: Vec<(usize, u32)> =
                mopt.iter().map(|m| (m.dev_index, m.group)).collect();
            drop(port);
            for (dev_index, group) in groups {
                if let Ok(Some(report)) = self.rebuild_group_aggregate(dev_index, group) {
                    if let Some(hook) = self.igmp_hook {
                        hook(dev_index, group, report);
                    }
                }
            }
        }
        Ok(())
    }

    /// 注册一个等待收包的任务
    pub fn udp_wait_recv(
        &mut self,
        socketd: usize,
        waiter: Arc<dyn SuspendedTask>,
    ) -> Result<(), NetError> {
        self.ports
            .get_mut(socketd)
            .ok_or(NetError::BadSocket)?
            .rx_waiters
            .push_back(waiter);
        Ok(())
    }

    /// 入站 IPv4 UDP 数据报分发入口
    ///
    /// # 参数
    /// - `meta`: IP 层解析出的源/目的地址
    /// - `chain`: 缓冲区链，首节点窗口从 UDP 头部开始
    ///
    /// # 返回
    /// - `Delivered`: 已递交（校验失败之外的丢弃也计入此类并计数）
    /// - `ChecksumError`: 校验失败，链已回收
    /// - `NoPort`: 没有匹配端口，链保留给调用方生成 ICMP
    pub fn udp4_input(&mut self, meta: &Ipv4Meta, chain: BufId) -> DispatchResult {
        let (src_port, dst_port, bcast, mcast, device);
        {
            let mut pool = self.pool.lock();

            let hdr_ok = (pool.node(chain).data_len as usize) >= UDP_HEADER_LEN
                && pool.node(chain).total_len >= UDP_HEADER_LEN as u32;
            if !hdr_ok {
                log::error!("malformed UDP datagram dropped");
                NetStats::inc(&self.stats.udp_in_errors);
                pool.free_mixed_chain(chain);
                return DispatchResult::ChecksumError;
            }

            src_port = pool.get16(chain, UDP_SRC_OFFSET);
            dst_port = pool.get16(chain, UDP_DEST_OFFSET);
            let hischeck = pool.get16(chain, UDP_CHECK_OFFSET);

            let head = pool.node(chain);
            let flags = head.flags;
            let total = head.total_len;
            let acc = head.acc;
            bcast = flags.contains(BufFlags::BCAST);
            mcast = flags.contains(BufFlags::MCAST);
            device = head.device.map(|d| d as usize);

            // 发送方填零的校验和无条件接受；硬件验证过的跳过软件验证
            if !flags.contains(BufFlags::HW_CHECKSUM) && hischeck != 0 {
                let pseudo =
                    pseudo_header_sum(meta.source, meta.dest, IP_PROTO_UDP, total as u16);

                let mut mycheck = if flags.contains(BufFlags::SUM) {
                    // 拷贝时折叠的运行总和里含校验和字段本身，先减掉
                    let mut acc = acc;
                    acc.sum += pseudo;
                    acc.sum -= hischeck as u32;
                    acc.finish()
                } else {
                    pool.put16(chain, UDP_CHECK_OFFSET, 0);
                    let check = pool.chain_checksum(chain, pseudo);
                    pool.put16(chain, UDP_CHECK_OFFSET, hischeck);
                    check
                };
                if mycheck == 0 {
                    mycheck = 0xFFFF;
                }

                if mycheck != hischeck {
                    log::error!("UDP checksum error, datagram dropped");
                    NetStats::inc(&self.stats.udp_in_errors);
                    pool.free_mixed_chain(chain);
                    return DispatchResult::ChecksumError;
                }
            }
        }

        let mut matched_copy = false;
        let mut refused_source = false;
        let mut saved: Option<usize> = None;

        for i in 0..UDP_MAX_PORTS {
            // 决策阶段只读端口表
            let action = {
                let port = match self.ports.get(i) {
                    Some(p) => p,
                    None => continue,
                };
                if port.lport != dst_port {
                    continue;
                }

                let matches = (!port.connected
                    && (port.laddr == meta.dest || port.laddr == IP_ADDR_ANY))
                    || (port.connected
                        && src_port == port.fport
                        && (port.laddr == meta.dest || port.laddr == IP_ADDR_ANY)
                        && port.faddr == meta.source)
                    || (mcast && port.moptions.is_some());
                if !matches {
                    continue;
                }

                if !mcast {
                    if bcast {
                        // 广播：每个匹配端口一份副本，不提前退出
                        ScanAction::DeliverCopy
                    } else if port.reuse_addr && port.laddr == IP_ADDR_ANY {
                        // 地址复用下的通配匹配先记下来，继续找精确匹配
                        ScanAction::Save
                    } else {
                        ScanAction::DeliverOriginal
                    }
                } else {
                    // 组播：必须真的是该（接口，组）的成员并通过源过滤
                    let membership = device.and_then(|d| {
                        port.moptions
                            .as_ref()
                            .and_then(|mo| mo.membership(d, meta.dest))
                    });
                    match membership {
                        Some(m) if m.accepts_source(meta.source) => ScanAction::DeliverCopy,
                        Some(_) => ScanAction::Refuse,
                        None => continue,
                    }
                }
            };

            match action {
                ScanAction::DeliverCopy => {
                    // 匹配即有归宿；副本分配失败的丢弃已在递交里计数
                    self.deliver_datagram(i, meta, chain, src_port, true);
                    matched_copy = true;
                }
                ScanAction::DeliverOriginal => {
                    // 精确匹配短路：原始链零拷贝上交
                    self.deliver_datagram(i, meta, chain, src_port, false);
                    return DispatchResult::Delivered;
                }
                ScanAction::Save => saved = Some(i),
                ScanAction::Refuse => {
                    // 源被过滤：静默丢弃并计数，继续扫描其他端口
                    log::debug!("multicast source refused by filter");
                    NetStats::inc(&self.stats.ip_in_addr_errors);
                    refused_source = true;
                }
            }
        }

        if matched_copy {
            // 副本递交的各端口不持有原始链，回收
            self.pool.lock().free_mixed_chain(chain);
            return DispatchResult::Delivered;
        }

        if let Some(i) = saved {
            self.deliver_datagram(i, meta, chain, src_port, false);
            return DispatchResult::Delivered;
        }

        if refused_source {
            // 有端口匹配但源全部被过滤：静默丢弃，不算无端口
            self.pool.lock().free_mixed_chain(chain);
            return DispatchResult::Delivered;
        }

        NetStats::inc(&self.stats.udp_no_ports);
        DispatchResult::NoPort
    }

    /// 把数据报递交到端口的接收队列
    ///
    /// `make_copy` 为真时制作独立副本，原始链归调用方；为假时
    /// 剥掉 UDP 头后独占原始链。队列满或副本分配失败时丢弃并计数
    fn deliver_datagram(
        &mut self,
        port_idx: usize,
        meta: &Ipv4Meta,
        chain: BufId,
        src_port: u16,
        make_copy: bool,
    ) {
        let port = match self.ports.get_mut(port_idx) {
            Some(p) => p,
            None => {
                if !make_copy {
                    self.pool.lock().free_mixed_chain(chain);
                }
                return;
            }
        };

        if port.recvpackets >= UDP_MAX_DGRAMS {
            log::info!("UDP datagram discarded: no room on the socket input list");
            NetStats::inc(&self.stats.udp_in_errors);
            if !make_copy {
                self.pool.lock().free_mixed_chain(chain);
            }
            return;
        }

        let payload_len;
        let waiter;
        {
            let mut pool = self.pool.lock();
            let total = pool.node(chain).total_len as usize;
            payload_len = total - UDP_HEADER_LEN;

            let deliver_head = if make_copy {
                let copy = match pool.chain_dequeue(0, payload_len) {
                    Some(c) => c,
                    None => {
                        log::info!("no buffers for datagram copy, delivery skipped");
                        NetStats::inc(&self.stats.udp_in_errors);
                        return;
                    }
                };
                pool.chain_copy(copy, chain, UDP_HEADER_LEN, payload_len);
                copy
            } else {
                // 原始链就地剥掉 UDP 头
                let head = pool.node_mut(chain);
                head.data_off += UDP_HEADER_LEN as u16;
                head.data_len -= UDP_HEADER_LEN as u16;
                head.total_len -= UDP_HEADER_LEN as u32;
                chain
            };

            {
                let node = pool.node_mut(deliver_head);
                node.from_addr = meta.source;
                node.from_port = src_port;
                node.port_index = Some(port_idx as u16);
            }
            pool.enqueue(&mut port.recvlist, deliver_head);
            waiter = port.rx_waiters.pop_front();
        }

        port.recvpackets += 1;
        port.recvbytes += payload_len as u32;
        NetStats::inc(&self.stats.udp_in_datagrams);

        // 恢复等待任务必须在池锁之外
        if let Some(w) = waiter {
            w.resume();
        }
    }

    /// 从接收队列读出一个数据报
    ///
    /// # 返回
    /// （读出字节数，发送方地址，发送方端口）；队列为空时
    /// 返回 `WouldBlock`
    ///
    /// # 说明
    /// 超出应用缓冲区的数据按 UDP 语义截断丢弃
    pub fn udp_recv_from(
        &mut self,
        socketd: usize,
        buf: &mut [u8],
    ) -> Result<(usize, u32, u16), NetError> {
        let port = self.ports.get_mut(socketd).ok_or(NetError::BadSocket)?;

        let (n, total, from_addr, from_port);
        {
            let mut pool = self.pool.lock();
            let head = pool
                .dequeue(&mut port.recvlist)
                .ok_or(NetError::WouldBlock)?;
            {
                let node = pool.node(head);
                total = node.total_len as usize;
                from_addr = node.from_addr;
                from_port = node.from_port;
            }
            n = pool.copy_out(head, buf, core::cmp::min(total, buf.len()));
            if n < total {
                log::info!("UDP read received more data than the application accepts");
            }
            pool.free_mixed_chain(head);
        }

        port.recvpackets -= 1;
        port.recvbytes -= total as u32;
        Ok((n, from_addr, from_port))
    }

    /// 发送一个 UDP 数据报
    ///
    /// # 说明
    /// 经由端口的缓存路由解析下一跳；数据在拷入链的同时折叠
    /// 校验和，再补上头部字和伪头部；按 RFC 768 把算出的 0
    /// 替换为 0xFFFF 后写入头部，交给出口设备的链路层钩子
    pub fn udp_send_to(
        &mut self,
        socketd: usize,
        data: &[u8],
        dest_addr: u32,
        dest_port: u16,
    ) -> Result<usize, NetError> {
        if data.len() > UDP_MAX_DATAGRAM || dest_port == 0 {
            return Err(NetError::InvalidArgument);
        }

        let Self { ports, devices, routes, pool, stats, .. } = self;

        let port = ports.get_mut(socketd).ok_or(NetError::BadSocket)?;
        if port.lport == 0 {
            // 未绑定时分配临时端口号
            port.lport = 0xC000 | socketd as u16;
        }

        let hints = RouteHints {
            bcast_if: port.bcast_if,
            mcast_if: port.moptions.as_ref().and_then(|m| m.out_device),
        };
        let route = port.route.resolve(dest_addr, hints, devices, routes)?;

        let dev = devices.get(route.dev_index).ok_or(NetError::RouteUnreachable)?;
        if !dev.is_up() && !dev.is_running() {
            return Err(NetError::RouteUnreachable);
        }

        let src_addr = if port.laddr != IP_ADDR_ANY { port.laddr } else { dev.addr };
        let udp_len = (UDP_HEADER_LEN + data.len()) as u16;

        {
            let mut pool = pool.lock();
            let head = pool
                .chain_dequeue(0, UDP_HEADER_LEN + data.len())
                .ok_or(NetError::ResourceExhausted)?;

            {
                let node = pool.node_mut(head);
                node.data_len = UDP_HEADER_LEN as u16;
                node.total_len = UDP_HEADER_LEN as u32;
                node.device = Some(route.dev_index as u16);
                if dest_addr == IP_ADDR_BROADCAST || dest_addr == dev.net_brdcast {
                    node.flags |= BufFlags::BCAST;
                } else if is_multicast(dest_addr) {
                    node.flags |= BufFlags::MCAST;
                }
            }
            pool.put16(head, UDP_SRC_OFFSET, port.lport);
            pool.put16(head, UDP_DEST_OFFSET, dest_port);
            pool.put16(head, UDP_LENGTH_OFFSET, udp_len);
            pool.put16(head, UDP_CHECK_OFFSET, 0);

            pool.copy_in(head, data, true);

            // 校验和 = 载荷运行累加 + 头部字 + 伪头部
            let mut acc = pool.node(head).acc;
            acc.add_word(port.lport);
            acc.add_word(dest_port);
            acc.add_word(udp_len);
            acc.sum += pseudo_header_sum(src_addr, dest_addr, IP_PROTO_UDP, udp_len);
            let mut check = acc.finish();
            if check == 0 {
                check = 0xFFFF;
            }
            pool.put16(head, UDP_CHECK_OFFSET, check);

            if let Some(xmit) = dev.xmit {
                if xmit(&pool, head) != 0 {
                    log::error!("link transmit failed on {:?}", &dev.name[..4]);
                }
            }
            pool.free_mixed_chain(head);
        }

        NetStats::inc(&stats.udp_out_datagrams);
        Ok(data.len())
    }
}
