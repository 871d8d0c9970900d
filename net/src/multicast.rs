//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! IPv4 组播成员管理
//!
//! 完全遵循 RFC 3376 的源过滤语义（INCLUDE / EXCLUDE）
//!
//! 成员关系归套接字所有，是唯一的事实来源；设备上的聚合过滤
//! 状态是派生数据，每次加入、退出或过滤更新后都从所有套接字的
//! 成员关系整体重算。聚合结果决定接口在链路上的通告行为

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::{IP_DEFAULT_MULTICAST_TTL, IP_MAX_MEMBERSHIPS, MAX_MULTICAST_SRC_ADDR};
use crate::errno::NetError;
use crate::ipv4::{is_multicast, IP_ADDR_ANY};
use crate::stack::NetStack;

/// 源过滤模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// 只接收源列表内的发送方
    Include,
    /// 接收源列表之外的所有发送方
    Exclude,
}

/// 成员状态变化需要在链路上通告的报文类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupReport {
    /// 接口上首次订阅该组
    MembershipReport,
    /// 聚合过滤模式切换为 INCLUDE
    ChangeToInclude,
    /// 聚合过滤模式切换为 EXCLUDE
    ChangeToExclude,
    /// 新放行了一些源
    AllowNewSources,
    /// 新阻断了一些源
    BlockOldSources,
    /// 接口上最后一个成员退出
    Leave,
}

/// 单个套接字在某个（接口，组）上的成员关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketMembership {
    /// 组播组地址
    pub group: u32,
    /// 成员所在设备索引
    pub dev_index: usize,
    /// 过滤模式
    pub filter_mode: FilterMode,
    num_src: u16,
    src_list: [u32; MAX_MULTICAST_SRC_ADDR],
}

impl SocketMembership {
    /// 创建成员关系；源列表长度由调用方先行校验
    pub fn new(group: u32, dev_index: usize, filter_mode: FilterMode, sources: &[u32]) -> Self {
        let mut m = Self {
            group,
            dev_index,
            filter_mode,
            num_src: 0,
            src_list: [0; MAX_MULTICAST_SRC_ADDR],
        };
        m.set_sources(sources);
        m
    }

    pub fn sources(&self) -> &[u32] {
        &self.src_list[..self.num_src as usize]
    }

    pub fn set_sources(&mut self, sources: &[u32]) {
        self.src_list[..sources.len()].copy_from_slice(sources);
        self.num_src = sources.len() as u16;
    }

    /// 源过滤判定
    ///
    /// INCLUDE：列表内放行；EXCLUDE：列表外放行
    pub fn accepts_source(&self, src: u32) -> bool {
        let listed = self.sources().contains(&src);
        match self.filter_mode {
            FilterMode::Include => listed,
            FilterMode::Exclude => !listed,
        }
    }
}

/// 套接字的组播选项
#[derive(Debug, Clone)]
pub struct MulticastOptions {
    /// 组播发送 TTL
    pub ttl: u8,
    /// 是否把组播回送给本机
    pub loopback: bool,
    /// 显式配置的组播出口接口
    pub out_device: Option<usize>,
    num_memberships: u16,
    memberships: [Option<SocketMembership>; IP_MAX_MEMBERSHIPS],
}

impl MulticastOptions {
    pub fn new() -> Self {
        const NONE: Option<SocketMembership> = None;
        Self {
            ttl: IP_DEFAULT_MULTICAST_TTL,
            loopback: true,
            out_device: None,
            num_memberships: 0,
            memberships: [NONE; IP_MAX_MEMBERSHIPS],
        }
    }

    pub fn len(&self) -> usize {
        self.num_memberships as usize
    }

    pub fn is_empty(&self) -> bool {
        self.num_memberships == 0
    }

    /// 查找（接口，组）对应的成员关系下标
    pub fn position(&self, dev_index: usize, group: u32) -> Option<usize> {
        (0..self.len()).find(|&i| {
            self.memberships[i]
                .as_ref()
                .is_some_and(|m| m.dev_index == dev_index && m.group == group)
        })
    }

    pub fn membership(&self, dev_index: usize, group: u32) -> Option<&SocketMembership> {
        self.position(dev_index, group)
            .and_then(|i| self.memberships[i].as_ref())
    }

    pub fn membership_at(&self, i: usize) -> Option<&SocketMembership> {
        self.memberships.get(i).and_then(|m| m.as_ref())
    }

    pub fn membership_at_mut(&mut self, i: usize) -> Option<&mut SocketMembership> {
        self.memberships.get_mut(i).and_then(|m| m.as_mut())
    }

    /// 追加成员关系
    pub fn add(&mut self, m: SocketMembership) -> Result<usize, NetError> {
        let i = self.len();
        if i >= IP_MAX_MEMBERSHIPS {
            return Err(NetError::TooManyGroups);
        }
        self.memberships[i] = Some(m);
        self.num_memberships += 1;
        Ok(i)
    }

    /// 摘除成员关系并压缩数组，不留空洞
    pub fn remove_at(&mut self, i: usize) {
        let n = self.len();
        if i >= n {
            return;
        }
        for j in i..n - 1 {
            self.memberships[j] = self.memberships[j + 1];
        }
        self.memberships[n - 1] = None;
        self.num_memberships -= 1;
    }

    /// 遍历全部成员关系
    pub fn iter(&self) -> impl Iterator<Item = &SocketMembership> {
        self.memberships[..self.len()].iter().flatten()
    }
}

impl Default for MulticastOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// 设备上某个组播组的聚合过滤状态
///
/// 由该设备上所有套接字成员关系派生；决定接口在链路上的行为
#[derive(Debug, Clone, Copy)]
pub struct DeviceGroupState {
    /// 组播组地址
    pub group: u32,
    /// 聚合过滤模式
    pub filter_mode: FilterMode,
    /// 该组在本设备上的成员数
    pub members: u16,
    num_src: u16,
    src_list: [u32; MAX_MULTICAST_SRC_ADDR],
}

impl DeviceGroupState {
    /// 初始状态：INCLUDE / 空源列表（不接收任何源）
    pub fn new(group: u32) -> Self {
        Self {
            group,
            filter_mode: FilterMode::Include,
            members: 0,
            num_src: 0,
            src_list: [0; MAX_MULTICAST_SRC_ADDR],
        }
    }

    pub fn sources(&self) -> &[u32] {
        &self.src_list[..self.num_src as usize]
    }

    pub fn set_sources(&mut self, sources: &[u32]) {
        self.src_list[..sources.len()].copy_from_slice(sources);
        self.num_src = sources.len() as u16;
    }

    /// 设备级源过滤判定
    pub fn accepts_source(&self, src: u32) -> bool {
        let listed = self.sources().contains(&src);
        match self.filter_mode {
            FilterMode::Include => listed,
            FilterMode::Exclude => !listed,
        }
    }
}

/// 把同一（接口，组）上的全部成员过滤合并为聚合过滤
///
/// # 返回
/// 聚合的（模式，源列表）；源列表超出上限时报错且不产生任何
/// 状态修改
///
/// # 说明
/// 从 INCLUDE / 空出发逐个并入成员：
/// - EXCLUDE 并入 INCLUDE 聚合：聚合翻转为 EXCLUDE，排除列表为
///   成员排除列表去掉已放行的源
/// - INCLUDE 并入 EXCLUDE 聚合：从排除列表里移除成员放行的源
/// - EXCLUDE 并入 EXCLUDE 聚合：两个排除列表取交集
/// - INCLUDE 并入 INCLUDE 聚合：两个放行列表取并集
fn combine_members(members: &[SocketMembership]) -> Result<(FilterMode, Vec<u32>), NetError> {
    let mut mode = FilterMode::Include;
    let mut list: Vec<u32> = Vec::new();

    for m in members {
        let msrc = m.sources();
        match (m.filter_mode, mode) {
            (FilterMode::Exclude, FilterMode::Include) => {
                let allowed = list;
                list = msrc
                    .iter()
                    .copied()
                    .filter(|s| !allowed.contains(s))
                    .collect();
                mode = FilterMode::Exclude;
            }
            (FilterMode::Include, FilterMode::Exclude) => {
                list.retain(|s| !msrc.contains(s));
            }
            (FilterMode::Exclude, FilterMode::Exclude) => {
                list.retain(|s| msrc.contains(s));
            }
            (FilterMode::Include, FilterMode::Include) => {
                for s in msrc {
                    if !list.contains(s) {
                        list.push(*s);
                    }
                }
            }
        }
    }

    if list.len() > MAX_MULTICAST_SRC_ADDR {
        log::error!("multicast aggregate source list overflow for group {:#x}",
                    members.first().map(|m| m.group).unwrap_or(0));
        return Err(NetError::TooManySources);
    }
    Ok((mode, list))
}

/// 比较新旧聚合状态，推导需要通告的报文
fn derive_report(
    prev_mode: FilterMode,
    prev: &[u32],
    new_mode: FilterMode,
    new: &[u32],
) -> Option<GroupReport> {
    match (prev_mode, new_mode) {
        (FilterMode::Include, FilterMode::Exclude) => Some(GroupReport::ChangeToExclude),
        (FilterMode::Exclude, FilterMode::Include) => Some(GroupReport::ChangeToInclude),
        (FilterMode::Exclude, FilterMode::Exclude) => {
            // 排除列表里新增的源是新被阻断的，移除的源是新放行的
            if new.iter().any(|s| !prev.contains(s)) {
                Some(GroupReport::BlockOldSources)
            } else if prev.iter().any(|s| !new.contains(s)) {
                Some(GroupReport::AllowNewSources)
            } else {
                None
            }
        }
        (FilterMode::Include, FilterMode::Include) => {
            if new.iter().any(|s| !prev.contains(s)) {
                Some(GroupReport::AllowNewSources)
            } else if prev.iter().any(|s| !new.contains(s)) {
                Some(GroupReport::BlockOldSources)
            } else {
                None
            }
        }
    }
}

/// 成员表变更的回滚快照
enum MembershipOp {
    Joined,
    Updated(SocketMembership),
    Left,
}

impl NetStack {
    /// 加入、退出或更新一个组播组的源过滤
    ///
    /// # 参数
    /// - `socketd`: 套接字描述符
    /// - `interface_addr`: 接口地址；`IP_ADDR_ANY` 表示由协议栈
    ///   选第一个支持组播的非回环设备
    /// - `multi_addr`: 组播组地址
    /// - `filter_mode`: INCLUDE / EXCLUDE
    /// - `sources`: 要放行或排除的源地址列表
    ///
    /// # 返回
    /// 本次变更在链路上需要通告的报文（若有）
    ///
    /// # 说明
    /// - 对已存在成员关系的 INCLUDE / 空源列表请求是退出操作；
    ///   成员关系本就处于 INCLUDE / 空状态时重复请求是幂等更新，
    ///   不会产生重复表项也不会误退出
    /// - 所有校验先于任何状态修改；聚合重算溢出时回滚套接字侧
    ///   的变更，保证无部分修改
    pub fn multicast_listen(
        &mut self,
        socketd: usize,
        interface_addr: u32,
        multi_addr: u32,
        filter_mode: FilterMode,
        sources: &[u32],
    ) -> Result<Option<GroupReport>, NetError> {
        if !is_multicast(multi_addr) {
            return Err(NetError::InvalidArgument);
        }
        if sources.len() > MAX_MULTICAST_SRC_ADDR {
            log::error!("multicast listen: {} sources exceeds cap", sources.len());
            return Err(NetError::TooManySources);
        }

        // 解析出具体接口
        let dev_index = if interface_addr == IP_ADDR_ANY {
            self.devices
                .first_multicast_device()
                .ok_or(NetError::InvalidArgument)?
                .index
        } else {
            let dev = self
                .devices
                .find_by_addr(interface_addr)
                .ok_or(NetError::InvalidArgument)?;
            if !dev.is_multicast() {
                return Err(NetError::InvalidArgument);
            }
            dev.index
        };

        // 套接字侧变更，保留回滚快照
        let op = {
            let port = self.ports.get_mut(socketd).ok_or(NetError::BadSocket)?;
            let mopt = port
                .moptions
                .get_or_insert_with(|| Box::new(MulticastOptions::new()));

            match mopt.position(dev_index, multi_addr) {
                None => {
                    // 不存在的成员关系一律按加入处理，INCLUDE/空也不例外
                    mopt.add(SocketMembership::new(
                        multi_addr, dev_index, filter_mode, sources,
                    ))?;
                    MembershipOp::Joined
                }
                Some(i) => {
                    let old = mopt
                        .membership_at(i)
                        .copied()
                        .ok_or(NetError::NotAGroupMember)?;
                    let already_idle =
                        old.filter_mode == FilterMode::Include && old.sources().is_empty();
                    let is_leave = filter_mode == FilterMode::Include
                        && sources.is_empty()
                        && !already_idle;

                    if is_leave {
                        mopt.remove_at(i);
                        MembershipOp::Left
                    } else if let Some(m) = mopt.membership_at_mut(i) {
                        m.filter_mode = filter_mode;
                        m.set_sources(sources);
                        MembershipOp::Updated(old)
                    } else {
                        return Err(NetError::NotAGroupMember);
                    }
                }
            }
        };

        // 设备聚合重算与通告
        match self.rebuild_group_aggregate(dev_index, multi_addr) {
            Ok(report) => {
                if let (Some(r), Some(hook)) = (report, self.igmp_hook) {
                    hook(dev_index, multi_addr, r);
                }
                Ok(report)
            }
            Err(e) => {
                // 聚合溢出：还原套接字侧的修改
                if let Some(mopt) = self
                    .ports
                    .get_mut(socketd)
                    .and_then(|p| p.moptions.as_mut())
                {
                    match op {
                        MembershipOp::Joined => {
                            if let Some(i) = mopt.position(dev_index, multi_addr) {
                                mopt.remove_at(i);
                            }
                        }
                        MembershipOp::Updated(old) => {
                            if let Some(i) = mopt.position(dev_index, multi_addr) {
                                if let Some(m) = mopt.membership_at_mut(i) {
                                    *m = old;
                                }
                            }
                        }
                        MembershipOp::Left => {}
                    }
                }
                Err(e)
            }
        }
    }

    /// 从所有套接字的成员关系重建（接口，组）的聚合状态
    ///
    /// # 返回
    /// 聚合变化对应的通告报文；没有变化时返回 `None`
    pub(crate) fn rebuild_group_aggregate(
        &mut self,
        dev_index: usize,
        group: u32,
    ) -> Result<Option<GroupReport>, NetError> {
        let members = self.ports.collect_memberships(dev_index, group);

        let dev = self
            .devices
            .get_mut(dev_index)
            .ok_or(NetError::InvalidArgument)?;

        if members.is_empty() {
            // 最后一个成员已退出：清掉聚合状态并通告离组
            if dev.find_group(group).is_some() {
                dev.remove_group(group);
                return Ok(Some(GroupReport::Leave));
            }
            return Ok(None);
        }

        // 先算后改：溢出时设备状态保持原样
        let (new_mode, new_list) = combine_members(&members)?;

        let (state, created) = dev.get_or_create_group(group)?;
        let prev_mode = state.filter_mode;
        let prev_list: Vec<u32> = state.sources().to_vec();

        state.filter_mode = new_mode;
        state.set_sources(&new_list);
        state.members = members.len() as u16;

        let report = derive_report(prev_mode, &prev_list, new_mode, &new_list);
        if created {
            // 接口上首次订阅必须发出成员报告
            return Ok(Some(report.unwrap_or(GroupReport::MembershipReport)));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(mode: FilterMode, sources: &[u32]) -> SocketMembership {
        SocketMembership::new(0xE0010101, 0, mode, sources)
    }

    #[test]
    fn test_filter_accepts_source() {
        let inc = member(FilterMode::Include, &[0xC0A80105]);
        assert!(inc.accepts_source(0xC0A80105));
        assert!(!inc.accepts_source(0xC0A80106));

        let exc = member(FilterMode::Exclude, &[0xC0A80105]);
        assert!(!exc.accepts_source(0xC0A80105));
        assert!(exc.accepts_source(0xC0A80106));
    }

    #[test]
    fn test_combine_include_union() {
        let members = [
            member(FilterMode::Include, &[1, 2]),
            member(FilterMode::Include, &[2, 3]),
        ];
        let (mode, list) = combine_members(&members).unwrap();
        assert_eq!(mode, FilterMode::Include);
        assert_eq!(list, alloc::vec![1, 2, 3]);
    }

    #[test]
    fn test_combine_exclude_intersection() {
        let members = [
            member(FilterMode::Exclude, &[1, 2, 3]),
            member(FilterMode::Exclude, &[2, 3, 4]),
        ];
        let (mode, list) = combine_members(&members).unwrap();
        assert_eq!(mode, FilterMode::Exclude);
        assert_eq!(list, alloc::vec![2, 3]);
    }

    #[test]
    fn test_combine_mixed_modes() {
        // INCLUDE{S1} + EXCLUDE{S1,S2}：聚合为 EXCLUDE{S2}
        let members = [
            member(FilterMode::Include, &[1]),
            member(FilterMode::Exclude, &[1, 2]),
        ];
        let (mode, list) = combine_members(&members).unwrap();
        assert_eq!(mode, FilterMode::Exclude);
        assert_eq!(list, alloc::vec![2]);

        // 反向次序结果一致
        let members = [
            member(FilterMode::Exclude, &[1, 2]),
            member(FilterMode::Include, &[1]),
        ];
        let (mode, list) = combine_members(&members).unwrap();
        assert_eq!(mode, FilterMode::Exclude);
        assert_eq!(list, alloc::vec![2]);
    }

    #[test]
    fn test_derive_report_mode_changes() {
        assert_eq!(
            derive_report(FilterMode::Include, &[], FilterMode::Exclude, &[1]),
            Some(GroupReport::ChangeToExclude)
        );
        assert_eq!(
            derive_report(FilterMode::Exclude, &[1], FilterMode::Include, &[]),
            Some(GroupReport::ChangeToInclude)
        );
        // EXCLUDE 列表收缩 = 放行新源
        assert_eq!(
            derive_report(FilterMode::Exclude, &[1, 2], FilterMode::Exclude, &[1]),
            Some(GroupReport::AllowNewSources)
        );
        // INCLUDE 列表增长 = 放行新源
        assert_eq!(
            derive_report(FilterMode::Include, &[1], FilterMode::Include, &[1, 2]),
            Some(GroupReport::AllowNewSources)
        );
        assert_eq!(
            derive_report(FilterMode::Include, &[1], FilterMode::Include, &[1]),
            None
        );
    }

    #[test]
    fn test_membership_table_compaction() {
        let mut mopt = MulticastOptions::new();
        mopt.add(SocketMembership::new(0xE0010101, 0, FilterMode::Exclude, &[]))
            .unwrap();
        mopt.add(SocketMembership::new(0xE0010102, 0, FilterMode::Exclude, &[]))
            .unwrap();
        mopt.add(SocketMembership::new(0xE0010103, 0, FilterMode::Exclude, &[]))
            .unwrap();

        mopt.remove_at(0);
        assert_eq!(mopt.len(), 2);
        // 压缩后没有空洞，顺序保持
        assert_eq!(mopt.membership_at(0).unwrap().group, 0xE0010102);
        assert_eq!(mopt.membership_at(1).unwrap().group, 0xE0010103);
        assert!(mopt.membership_at(2).is_none());
    }
}
