//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 网络缓冲区池
//!
//! 参考 BSD mbuf 与 Linux sk_buff 的链式缓冲区设计
//!
//! 所有节点在初始化时一次性划分，此后只在各条链表之间循环流转，
//! 进程生命周期内从不单独释放。每个节点带两条互相独立的链接：
//! - `next`：队列成员链接（空闲链表、接收队列）
//! - `next_buffer`：同一个数据包内分段的链接
//!
//! 两条链接永远不能混用。
//!
//! 池本身不做加锁；调用方用一把 `spin::Mutex` 包住整个池，
//! 对应嵌入式目标上关中断的临界区

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::checksum::ChecksumAcc;
use crate::config::{NET_BUFFER_SIZE, NET_FREE_LOW_WATER, NET_WAKE_QUEUE_SIZE};
use crate::wake::WakeChannel;

/// 缓冲区节点索引
pub type BufId = u16;

bitflags! {
    /// 节点标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufFlags: u16 {
        /// 链单元的首节点
        const PARENT = 0x01;
        /// 广播数据报
        const BCAST = 0x02;
        /// 组播数据报
        const MCAST = 0x04;
        /// 校验和累加器中带有拷贝时折叠出的运行总和
        const SUM = 0x08;
        /// 校验和已由硬件验证
        const HW_CHECKSUM = 0x10;
    }
}

/// 等待空闲缓冲区的挂起任务
///
/// `resume` 由延迟唤醒上下文调用，绝不会在池的临界区内执行
pub trait SuspendedTask: Send + Sync {
    fn resume(&self);
}

/// 缓冲区节点
///
/// `packet` 是节点内置的数据区；零拷贝模式下 `external` 持有
/// 调用方移交的缓冲区，此时窗口落在外部缓冲区上
pub struct BufferNode {
    /// 队列成员链接
    pub next: Option<BufId>,
    /// 数据包分段链接
    pub next_buffer: Option<BufId>,
    /// 有效数据窗口起点
    pub data_off: u16,
    /// 有效数据窗口长度
    pub data_len: u16,
    /// 整条链的总数据长度（仅首节点有效）
    pub total_len: u32,
    /// 运行校验和累加器（仅首节点有效）
    pub acc: ChecksumAcc,
    /// 节点标志
    pub flags: BufFlags,
    /// 收包设备索引
    pub device: Option<u16>,
    /// 递交端口索引
    pub port_index: Option<u16>,
    /// IP 选项长度
    pub option_len: u16,
    /// 重传计数
    pub retx_count: u8,
    /// 归属空闲链表编号（释放时回到哪个分区）
    pub dlist: u8,
    /// 发送方地址（递交后仅首节点有效）
    pub from_addr: u32,
    /// 发送方端口（递交后仅首节点有效）
    pub from_port: u16,
    /// 零拷贝外部缓冲区
    pub external: Option<Arc<[u8]>>,
    /// 内置数据区
    pub packet: [u8; NET_BUFFER_SIZE],
}

impl BufferNode {
    fn new(dlist: u8) -> Self {
        Self {
            next: None,
            next_buffer: None,
            data_off: 0,
            data_len: 0,
            total_len: 0,
            acc: ChecksumAcc::new(),
            flags: BufFlags::empty(),
            device: None,
            port_index: None,
            option_len: 0,
            retx_count: 0,
            dlist,
            from_addr: 0,
            from_port: 0,
            external: None,
            packet: [0; NET_BUFFER_SIZE],
        }
    }

    /// 清零所有元数据
    ///
    /// `dlist` 记录节点的归属分区，不参与清零
    fn zero_metadata(&mut self) {
        self.next = None;
        self.next_buffer = None;
        self.data_off = 0;
        self.data_len = 0;
        self.total_len = 0;
        self.acc = ChecksumAcc::new();
        self.flags = BufFlags::empty();
        self.device = None;
        self.port_index = None;
        self.option_len = 0;
        self.retx_count = 0;
        self.from_addr = 0;
        self.from_port = 0;
        self.external = None;
    }

    /// 当前有效数据窗口
    pub fn window(&self) -> &[u8] {
        let off = self.data_off as usize;
        let len = self.data_len as usize;
        match &self.external {
            Some(ext) => &ext[off..off + len],
            None => &self.packet[off..off + len],
        }
    }

    /// 节点可容纳的数据上限
    pub fn capacity(&self) -> usize {
        match &self.external {
            Some(ext) => ext.len(),
            None => NET_BUFFER_SIZE,
        }
    }
}

/// 缓冲区 FIFO 链表
///
/// 只保存头尾索引和长度，节点间的连接存放在节点自身的 `next` 域
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferList {
    pub head: Option<BufId>,
    pub tail: Option<BufId>,
    pub len: usize,
}

impl BufferList {
    pub const fn new() -> Self {
        Self { head: None, tail: None, len: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// 缓冲区池
///
/// 节点数组 + 一条或多条空闲链表 + 占用计数 + 挂起队列。
/// 不变式：`used_count + Σ 空闲链表长度 == capacity`
pub struct BufferPool {
    nodes: Vec<BufferNode>,
    free: Vec<BufferList>,
    used_count: usize,
    wake_threshold: usize,
    suspended: VecDeque<Arc<dyn SuspendedTask>>,
    wake: Arc<WakeChannel>,
}

impl BufferPool {
    /// 创建单分区缓冲区池
    ///
    /// # 参数
    /// - `capacity`: 节点总数
    pub fn new(capacity: usize) -> Self {
        Self::new_partitioned(&[capacity])
    }

    /// 创建多分区缓冲区池
    ///
    /// # 参数
    /// - `parts`: 每个分区的节点数，分区各自维护一条空闲链表
    ///
    /// # 说明
    /// 典型用法是系统分区 + 驱动私有分区；节点的 `dlist` 记录
    /// 归属分区，混合链释放时各段回到各自的分区
    pub fn new_partitioned(parts: &[usize]) -> Self {
        let capacity: usize = parts.iter().sum();
        assert!(capacity > 0 && capacity < BufId::MAX as usize);
        assert!(parts.len() <= u8::MAX as usize);

        let mut nodes = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(parts.len());
        let mut id: BufId = 0;

        for (list_id, &count) in parts.iter().enumerate() {
            let mut list = BufferList::new();
            for _ in 0..count {
                nodes.push(BufferNode::new(list_id as u8));
                Self::list_enqueue(&mut nodes, &mut list, id);
                id += 1;
            }
            free.push(list);
        }

        Self {
            nodes,
            free,
            used_count: 0,
            wake_threshold: NET_FREE_LOW_WATER,
            suspended: VecDeque::new(),
            wake: Arc::new(WakeChannel::new(NET_WAKE_QUEUE_SIZE)),
        }
    }

    /// 设置空闲链表低水位线
    pub fn set_wake_threshold(&mut self, threshold: usize) {
        self.wake_threshold = threshold;
    }

    /// 延迟唤醒通道
    pub fn wake_channel(&self) -> Arc<WakeChannel> {
        self.wake.clone()
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn used_count(&self) -> usize {
        self.used_count
    }

    /// 指定分区的空闲节点数
    pub fn free_len(&self, list_id: usize) -> usize {
        self.free[list_id].len
    }

    /// 所有分区的空闲节点总数
    pub fn total_free(&self) -> usize {
        self.free.iter().map(|l| l.len).sum()
    }

    pub fn node(&self, id: BufId) -> &BufferNode {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: BufId) -> &mut BufferNode {
        &mut self.nodes[id as usize]
    }

    fn list_enqueue(nodes: &mut [BufferNode], list: &mut BufferList, id: BufId) {
        nodes[id as usize].next = None;
        match list.tail {
            Some(tail) => nodes[tail as usize].next = Some(id),
            None => list.head = Some(id),
        }
        list.tail = Some(id);
        list.len += 1;
    }

    fn list_dequeue(nodes: &mut [BufferNode], list: &mut BufferList) -> Option<BufId> {
        let head = list.head?;
        list.head = nodes[head as usize].next;
        if list.head.is_none() {
            list.tail = None;
        }
        nodes[head as usize].next = None;
        list.len -= 1;
        Some(head)
    }

    /// 从队列尾部压入节点（O(1)）
    pub fn enqueue(&mut self, list: &mut BufferList, id: BufId) {
        Self::list_enqueue(&mut self.nodes, list, id);
    }

    /// 从队列头部弹出节点（O(1)）
    ///
    /// 队列为空时返回 `None`，永不阻塞
    pub fn dequeue(&mut self, list: &mut BufferList) -> Option<BufId> {
        Self::list_dequeue(&mut self.nodes, list)
    }

    /// 从空闲链表分配一个节点
    ///
    /// # 返回
    /// 池耗尽时返回 `None`，永不阻塞；调用方应自行挂起
    /// （见 [`BufferPool::suspend`]）
    ///
    /// # 说明
    /// 弹出的节点所有元数据清零，`used_count` 加一
    pub fn dequeue_free(&mut self, list_id: usize) -> Option<BufId> {
        let mut list = self.free[list_id];
        let id = Self::list_dequeue(&mut self.nodes, &mut list)?;
        self.free[list_id] = list;

        let node = &mut self.nodes[id as usize];
        node.zero_metadata();
        node.dlist = list_id as u8;
        self.used_count += 1;
        Some(id)
    }

    /// 把节点还回它归属的空闲链表
    ///
    /// # 说明
    /// 入队前清零所有元数据，空闲链表上的节点始终是干净的。
    /// `used_count` 减一；若挂起队列非空且该分区空闲数回升到
    /// 低水位线，则向延迟唤醒通道投递一条唤醒消息。实际的任务
    /// 恢复由唤醒工作者异步完成，这里绝不直接调用调度器
    pub fn enqueue_free(&mut self, id: BufId) {
        let list_id = self.nodes[id as usize].dlist as usize;

        self.nodes[id as usize].zero_metadata();

        let mut list = self.free[list_id];
        Self::list_enqueue(&mut self.nodes, &mut list, id);
        self.free[list_id] = list;
        self.used_count -= 1;

        if !self.suspended.is_empty() && self.free[list_id].len >= self.wake_threshold {
            self.wake.post();
        }
    }

    /// 挂起一个等待空闲缓冲区的任务（FIFO）
    pub fn suspend(&mut self, waiter: Arc<dyn SuspendedTask>) {
        self.suspended.push_back(waiter);
    }

    /// 取出挂起队列头部的任务
    ///
    /// 仅由唤醒工作者调用
    pub fn take_head_waiter(&mut self) -> Option<Arc<dyn SuspendedTask>> {
        self.suspended.pop_front()
    }

    pub fn suspended_len(&self) -> usize {
        self.suspended.len()
    }

    /// 分配一条能容纳 `len` 字节的缓冲区链
    ///
    /// # 返回
    /// 首节点索引；池不足时整体回滚并返回 `None`，不留下部分分配
    ///
    /// # 说明
    /// 各分段经 `next_buffer` 相连，首节点打上 PARENT 标志，
    /// 总长度从零开始由拷贝引擎累加
    pub fn chain_dequeue(&mut self, list_id: usize, len: usize) -> Option<BufId> {
        let count = core::cmp::max(1, len.div_ceil(NET_BUFFER_SIZE));

        let head = self.dequeue_free(list_id)?;
        let mut tail = head;

        for _ in 1..count {
            match self.dequeue_free(list_id) {
                Some(id) => {
                    self.nodes[tail as usize].next_buffer = Some(id);
                    tail = id;
                }
                None => {
                    // 部分分配必须整体回滚
                    self.free_chain(head, list_id);
                    return None;
                }
            }
        }

        self.nodes[head as usize].flags |= BufFlags::PARENT;
        Some(head)
    }

    /// 释放队列头部的整条链
    ///
    /// 从 `src` 弹出首节点，沿 `next_buffer` 把每个分段单独还给
    /// `dest` 分区的空闲链表，链被拆散成独立节点
    ///
    /// # 返回
    /// 实际释放的节点数
    pub fn chain_free(&mut self, src: &mut BufferList, dest_list: usize) -> usize {
        match self.dequeue(src) {
            Some(head) => self.free_chain(head, dest_list),
            None => 0,
        }
    }

    /// 释放一条已经脱离队列的链
    pub fn free_chain(&mut self, head: BufId, dest_list: usize) -> usize {
        let mut count = 0;
        let mut cur = Some(head);
        while let Some(id) = cur {
            cur = self.nodes[id as usize].next_buffer;
            self.nodes[id as usize].dlist = dest_list as u8;
            self.enqueue_free(id);
            count += 1;
        }
        count
    }

    /// 释放一条分段来自不同分区的混合链
    ///
    /// 按每个节点的 `dlist` 归属，把各分段还回各自的分区
    pub fn free_mixed_chain(&mut self, head: BufId) -> usize {
        let mut count = 0;
        let mut cur = Some(head);
        while let Some(id) = cur {
            cur = self.nodes[id as usize].next_buffer;
            self.enqueue_free(id);
            count += 1;
        }
        count
    }

    /// 链的分段数
    pub fn chain_len(&self, head: BufId) -> usize {
        let mut count = 0;
        let mut cur = Some(head);
        while let Some(id) = cur {
            count += 1;
            cur = self.nodes[id as usize].next_buffer;
        }
        count
    }

    /// 读取窗口内偏移处的 16 位大端字
    pub fn get16(&self, id: BufId, off: usize) -> u16 {
        let w = self.node(id).window();
        u16::from_be_bytes([w[off], w[off + 1]])
    }

    /// 向窗口内偏移处写入 16 位大端字
    ///
    /// 只允许写内置数据区；零拷贝节点的外部缓冲区是只读的
    pub fn put16(&mut self, id: BufId, off: usize, val: u16) {
        let node = &mut self.nodes[id as usize];
        debug_assert!(node.external.is_none());
        let start = node.data_off as usize + off;
        node.packet[start..start + 2].copy_from_slice(&val.to_be_bytes());
    }
}
