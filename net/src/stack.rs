//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 协议栈实例
//!
//! 所有有界注册表（缓冲区池、端口表、设备表、路由表）集中在
//! 一个栈对象里按引用传递，不使用文件级全局变量。缓冲区池是
//! 唯一会被中断上下文触碰的资源，由一把自旋锁保护；其余注册表
//! 由持有 `&mut NetStack` 的任务上下文独占

use alloc::sync::Arc;
use spin::Mutex;

use crate::buffer::BufferPool;
use crate::device::DeviceTable;
use crate::errno::NetError;
use crate::multicast::GroupReport;
use crate::route::{RouteEntry, RouteTable};
use crate::stats::NetStats;
use crate::udp::PortTable;
use crate::wake::WakeWorker;

/// 组播成员报告通告钩子
///
/// 参数：设备索引、组地址、报文类型
pub type IgmpHook = fn(usize, u32, GroupReport);

/// 网络协议栈
pub struct NetStack {
    /// 缓冲区池（中断与任务共享，自旋锁即临界区）
    pub pool: Mutex<BufferPool>,
    /// UDP 端口表
    pub ports: PortTable,
    /// 设备表
    pub devices: DeviceTable,
    /// 路由表
    pub routes: RouteTable,
    /// 统计计数器
    pub stats: NetStats,
    /// 组播通告钩子
    pub igmp_hook: Option<IgmpHook>,
}

impl NetStack {
    /// 初始化协议栈
    ///
    /// # 参数
    /// - `pool_capacity`: 缓冲区池容量（节点数）
    ///
    /// # 说明
    /// 池在启动阶段建不起来是致命错误：没有缓冲区一切都无从
    /// 谈起，直接 panic 终止启动
    pub fn new(pool_capacity: usize) -> Self {
        let pool = BufferPool::new(pool_capacity);
        log::info!("net stack init: {} buffers", pool_capacity);
        Self {
            pool: Mutex::new(pool),
            ports: PortTable::new(),
            devices: DeviceTable::new(),
            routes: RouteTable::new(),
            stats: NetStats::new(),
            igmp_hook: None,
        }
    }

    /// 创建服务延迟唤醒通道的工作者
    pub fn wake_worker(&self) -> WakeWorker {
        WakeWorker::new(self.pool.lock().wake_channel())
    }

    /// 添加路由
    pub fn route_add(
        &mut self,
        dst: u32,
        mask: u32,
        gateway: u32,
        dev_index: usize,
    ) -> Result<Arc<RouteEntry>, NetError> {
        if self.devices.get(dev_index).is_none() {
            return Err(NetError::InvalidArgument);
        }
        self.routes.add(dst, mask, gateway, dev_index)
    }

    /// 删除路由
    ///
    /// 删除后遍历端口表，清掉所有指向该表项的缓存路由，
    /// 下次发送时强制重新解析；无关端口的缓存不受影响
    pub fn route_remove(&mut self, dst: u32, mask: u32) -> bool {
        match self.routes.remove(dst, mask) {
            Some(entry) => {
                self.ports.free_cached_routes(&entry);
                true
            }
            None => false,
        }
    }
}
