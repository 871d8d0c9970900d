//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 网络设备表
//!
//! 参考 Linux 的 net_device 设计: include/linux/netdevice.h
//!
//! 协议栈核心只消费设备的边界信息：接口地址、能力标志、
//! 链路层发送钩子，以及设备级的组播聚合状态

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::buffer::{BufId, BufferPool};
use crate::config::{DEV_MAX_GROUPS, DEV_TABLE_SIZE, IFNAMSIZ};
use crate::errno::NetError;
use crate::multicast::DeviceGroupState;

bitflags! {
    /// 设备标志
    ///
    /// 对应 Linux 的 IFF_* (include/linux/if.h)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        const UP        = 0x0001;
        const BROADCAST = 0x0002;
        const LOOPBACK  = 0x0008;
        const RUNNING   = 0x0040;
        const MULTICAST = 0x1000;
    }
}

/// 链路层发送钩子
///
/// 在池锁内调用，拿到的是只读的链视图；发送完成后由协议栈
/// 负责释放链
pub type XmitHook = fn(pool: &BufferPool, head: BufId) -> i32;

/// 网络设备表项
pub struct DeviceEntry {
    /// 设备名
    pub name: [u8; IFNAMSIZ],
    /// 设备索引
    pub index: usize,
    /// 接口 IP 地址（主机序）
    pub addr: u32,
    /// 网络掩码
    pub mask: u32,
    /// 网络地址
    pub net: u32,
    /// 网络广播地址
    pub net_brdcast: u32,
    /// MTU
    pub mtu: u32,
    /// 设备标志
    pub flags: DeviceFlags,
    /// 链路层发送钩子
    pub xmit: Option<XmitHook>,
    /// 设备级组播聚合状态
    pub groups: [Option<DeviceGroupState>; DEV_MAX_GROUPS],
}

impl DeviceEntry {
    fn new(name: &str, addr: u32, mask: u32, flags: DeviceFlags, mtu: u32) -> Self {
        let mut name_buf = [0u8; IFNAMSIZ];
        let bytes = name.as_bytes();
        let n = core::cmp::min(bytes.len(), IFNAMSIZ - 1);
        name_buf[..n].copy_from_slice(&bytes[..n]);

        const NONE: Option<DeviceGroupState> = None;
        Self {
            name: name_buf,
            index: 0,
            addr,
            mask,
            net: addr & mask,
            net_brdcast: (addr & mask) | !mask,
            mtu,
            flags,
            xmit: None,
            groups: [NONE; DEV_MAX_GROUPS],
        }
    }

    pub fn is_up(&self) -> bool {
        self.flags.contains(DeviceFlags::UP)
    }

    pub fn is_running(&self) -> bool {
        self.flags.contains(DeviceFlags::RUNNING)
    }

    pub fn is_loopback(&self) -> bool {
        self.flags.contains(DeviceFlags::LOOPBACK)
    }

    pub fn is_multicast(&self) -> bool {
        self.flags.contains(DeviceFlags::MULTICAST)
    }

    /// 启用设备
    pub fn up(&mut self) {
        self.flags |= DeviceFlags::UP | DeviceFlags::RUNNING;
    }

    /// 停用设备
    ///
    /// 指向该设备的缓存路由会在下次解析时因有效性检查失败而重建
    pub fn down(&mut self) {
        self.flags &= !(DeviceFlags::UP | DeviceFlags::RUNNING);
    }

    /// 查找本设备上某个组播组的聚合状态
    pub fn find_group(&self, group: u32) -> Option<&DeviceGroupState> {
        self.groups
            .iter()
            .flatten()
            .find(|state| state.group == group)
    }

    pub fn find_group_mut(&mut self, group: u32) -> Option<&mut DeviceGroupState> {
        self.groups
            .iter_mut()
            .flatten()
            .find(|state| state.group == group)
    }

    /// 取得（必要时创建）某个组播组的聚合状态
    ///
    /// # 返回
    /// 新建时返回 `(state, true)`；组状态表满时返回错误
    pub fn get_or_create_group(
        &mut self,
        group: u32,
    ) -> Result<(&mut DeviceGroupState, bool), NetError> {
        let existing = self
            .groups
            .iter()
            .position(|s| s.as_ref().is_some_and(|g| g.group == group));

        match existing {
            Some(i) => {
                let state = self.groups[i].get_or_insert_with(|| DeviceGroupState::new(group));
                Ok((state, false))
            }
            None => {
                let slot = self
                    .groups
                    .iter_mut()
                    .find(|s| s.is_none())
                    .ok_or(NetError::TooManyGroups)?;
                Ok((slot.insert(DeviceGroupState::new(group)), true))
            }
        }
    }

    /// 删除某个组播组的聚合状态
    pub fn remove_group(&mut self, group: u32) {
        for slot in self.groups.iter_mut() {
            if slot.as_ref().is_some_and(|g| g.group == group) {
                *slot = None;
                return;
            }
        }
    }
}

/// 网络设备表
///
/// 有界注册表；设备在协议栈初始化阶段注册，此后只做状态变更
pub struct DeviceTable {
    devices: Vec<DeviceEntry>,
}

impl DeviceTable {
    pub const fn new() -> Self {
        Self { devices: Vec::new() }
    }

    /// 注册一个设备
    ///
    /// # 返回
    /// 设备索引；设备表满时返回错误
    pub fn register(
        &mut self,
        name: &str,
        addr: u32,
        mask: u32,
        flags: DeviceFlags,
        mtu: u32,
        xmit: Option<XmitHook>,
    ) -> Result<usize, NetError> {
        if self.devices.len() >= DEV_TABLE_SIZE {
            return Err(NetError::InvalidArgument);
        }
        let index = self.devices.len();
        let mut entry = DeviceEntry::new(name, addr, mask, flags, mtu);
        entry.index = index;
        entry.xmit = xmit;
        self.devices.push(entry);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeviceEntry> {
        self.devices.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DeviceEntry> {
        self.devices.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.iter()
    }

    /// 按接口地址查找设备
    pub fn find_by_addr(&self, addr: u32) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.addr == addr)
    }

    /// 通配接口解析：第一个支持组播的非回环设备
    ///
    /// # 说明
    /// 只有在找不到任何其他候选时才退回支持组播的回环设备
    pub fn first_multicast_device(&self) -> Option<&DeviceEntry> {
        let mut last_resort = None;
        for device in self.devices.iter() {
            if device.is_multicast() {
                if device.is_loopback() {
                    last_resort = Some(device);
                } else {
                    return Some(device);
                }
            }
        }
        last_resort
    }

    /// 主接口：第一个非回环设备，全部是回环时取第一个设备
    pub fn primary_device(&self) -> Option<&DeviceEntry> {
        self.devices
            .iter()
            .find(|d| !d.is_loopback())
            .or_else(|| self.devices.first())
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_address_derivation() {
        let mut table = DeviceTable::new();
        let idx = table
            .register(
                "eth0",
                0xC0A80102,
                0xFFFFFF00,
                DeviceFlags::UP | DeviceFlags::RUNNING | DeviceFlags::BROADCAST,
                1500,
                None,
            )
            .unwrap();

        let dev = table.get(idx).unwrap();
        assert_eq!(dev.net, 0xC0A80100);
        assert_eq!(dev.net_brdcast, 0xC0A801FF);
        assert!(dev.is_up());
        assert!(!dev.is_multicast());
    }

    #[test]
    fn test_wildcard_multicast_resolution() {
        let mut table = DeviceTable::new();
        table
            .register(
                "lo",
                0x7F000001,
                0xFF000000,
                DeviceFlags::UP | DeviceFlags::RUNNING | DeviceFlags::LOOPBACK
                    | DeviceFlags::MULTICAST,
                16436,
                None,
            )
            .unwrap();

        // 只有回环时退而求其次
        assert!(table.first_multicast_device().unwrap().is_loopback());

        table
            .register(
                "eth0",
                0xC0A80102,
                0xFFFFFF00,
                DeviceFlags::UP | DeviceFlags::RUNNING | DeviceFlags::MULTICAST,
                1500,
                None,
            )
            .unwrap();

        // 出现非回环候选后优先选它
        let dev = table.first_multicast_device().unwrap();
        assert!(!dev.is_loopback());
        assert_eq!(dev.addr, 0xC0A80102);
    }

    #[test]
    fn test_down_clears_running() {
        let mut table = DeviceTable::new();
        let idx = table
            .register("eth0", 0xC0A80102, 0xFFFFFF00, DeviceFlags::empty(), 1500, None)
            .unwrap();

        let dev = table.get_mut(idx).unwrap();
        dev.up();
        assert!(dev.is_up() && dev.is_running());
        dev.down();
        assert!(!dev.is_up() && !dev.is_running());
    }
}
