//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 缓冲区链拷贝引擎
//!
//! 平面缓冲区与缓冲区链之间的双向拷贝：
//! - 入链拷贝在复制的同时把数据折叠进 RFC 1071 运行校验和，
//!   奇数字节跨节点、跨调用正确进位
//! - 零拷贝模式移交调用方缓冲区的所有权，不复制内容
//! - 出链拷贝是破坏性的流式读取，链在部分读取后仍然有效
//!
//! 两个拷贝方向都不返回错误码；空间与数据量由调用方保证

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::buffer::{BufFlags, BufId, BufferPool};
use crate::checksum::ChecksumAcc;
use crate::config::NET_BUFFER_SIZE;

impl BufferPool {
    /// 向链内拷贝数据，同时折叠运行校验和
    ///
    /// # 参数
    /// - `head`: 链首节点
    /// - `data`: 源数据
    /// - `with_checksum`: 是否把本段数据折叠进首节点的累加器
    ///
    /// # 返回
    /// 实际拷贝的字节数
    ///
    /// # 说明
    /// 从第一个有剩余空间的节点开始填充，绝不分配新节点；
    /// 链容量由调用方在分配时保证
    pub fn copy_in(&mut self, head: BufId, data: &[u8], with_checksum: bool) -> usize {
        let mut cur = Some(head);
        let mut remaining = data;

        while let Some(id) = cur {
            if remaining.is_empty() {
                break;
            }
            let node = self.node_mut(id);
            let start = node.data_off as usize + node.data_len as usize;
            let room = NET_BUFFER_SIZE.saturating_sub(start);
            if room > 0 {
                let take = core::cmp::min(room, remaining.len());
                node.packet[start..start + take].copy_from_slice(&remaining[..take]);
                node.data_len += take as u16;
                remaining = &remaining[take..];
            }
            cur = self.node(id).next_buffer;
        }

        let copied = data.len() - remaining.len();
        let h = self.node_mut(head);
        h.total_len += copied as u32;
        if with_checksum {
            h.acc.add(&data[..copied]);
            h.flags |= BufFlags::SUM;
        }
        debug_assert!(remaining.is_empty(), "chain capacity exhausted");
        copied
    }

    /// 零拷贝模式：把调用方缓冲区挂接进链
    ///
    /// # 说明
    /// 缓冲区所有权移入第一个空节点，只设置窗口长度不复制内容；
    /// 其后不再需要的尾部节点立即归还空闲链表。链上没有空节点时
    /// 退化为内置拷贝
    pub fn zero_copy_in(&mut self, head: BufId, data: Arc<[u8]>) -> usize {
        let len = data.len();

        // 找第一个完全空置的节点
        let mut attach = None;
        let mut cur = Some(head);
        while let Some(id) = cur {
            if self.node(id).data_len == 0 && self.node(id).external.is_none() {
                attach = Some(id);
                break;
            }
            cur = self.node(id).next_buffer;
        }

        let attach = match attach {
            Some(id) => id,
            None => return self.copy_in(head, &data, false),
        };

        let trailing = {
            let node = self.node_mut(attach);
            node.external = Some(data);
            node.data_off = 0;
            node.data_len = len as u16;
            node.next_buffer.take()
        };

        if let Some(t) = trailing {
            self.free_mixed_chain(t);
        }

        self.node_mut(head).total_len += len as u32;
        len
    }

    /// 从链内流式读出数据（破坏性）
    ///
    /// # 参数
    /// - `head`: 链首节点
    /// - `dst`: 目标缓冲区
    /// - `n`: 要读出的字节数
    ///
    /// # 返回
    /// 实际读出的字节数
    ///
    /// # 说明
    /// 每读出一段就推进该节点的窗口起点、缩短窗口长度，
    /// 链保持有效，支持后续的继续读取
    pub fn copy_out(&mut self, head: BufId, dst: &mut [u8], n: usize) -> usize {
        let mut want = core::cmp::min(n, dst.len());
        let mut copied = 0;
        let mut cur = Some(head);

        while want > 0 {
            let id = match cur {
                Some(id) => id,
                None => break,
            };
            let take = {
                let node = self.node_mut(id);
                let avail = node.data_len as usize;
                let take = core::cmp::min(avail, want);
                if take > 0 {
                    let off = node.data_off as usize;
                    match &node.external {
                        Some(ext) => dst[copied..copied + take]
                            .copy_from_slice(&ext[off..off + take]),
                        None => dst[copied..copied + take]
                            .copy_from_slice(&node.packet[off..off + take]),
                    }
                    node.data_off += take as u16;
                    node.data_len -= take as u16;
                }
                take
            };
            copied += take;
            want -= take;
            if want > 0 {
                cur = self.node(id).next_buffer;
            }
        }

        let h = self.node_mut(head);
        h.total_len -= copied as u32;
        copied
    }

    /// 遍历链上指定范围的数据段
    ///
    /// # 参数
    /// - `off`: 相对当前窗口的起始偏移
    /// - `n`: 遍历的字节数
    /// - `f`: 对每个连续数据段调用一次
    ///
    /// # 说明
    /// 非破坏性。这是"跨链处理 N 个字节"的通用迭代契约，
    /// 校验和、摘要折叠等消费者共用
    pub fn for_each_segment<F>(&self, head: BufId, off: usize, n: usize, mut f: F)
    where
        F: FnMut(&[u8]),
    {
        let mut skip = off;
        let mut want = n;
        let mut cur = Some(head);

        while want > 0 {
            let id = match cur {
                Some(id) => id,
                None => break,
            };
            let node = self.node(id);
            let window = node.window();
            if skip < window.len() {
                let take = core::cmp::min(window.len() - skip, want);
                f(&window[skip..skip + take]);
                want -= take;
                skip = 0;
            } else {
                skip -= window.len();
            }
            cur = node.next_buffer;
        }
    }

    /// 对整条链计算 Internet 校验和
    ///
    /// # 参数
    /// - `pseudo_sum`: 伪头部的部分和（未折叠）
    ///
    /// # 返回
    /// 最终校验和（已取反）
    pub fn chain_checksum(&self, head: BufId, pseudo_sum: u32) -> u16 {
        let mut acc = ChecksumAcc { sum: pseudo_sum, pending: None };
        let total = self.node(head).total_len as usize;
        self.for_each_segment(head, 0, total, |seg| acc.add(seg));
        acc.finish()
    }

    /// 在两条链之间复制数据
    ///
    /// # 参数
    /// - `dst`: 目标链首节点（按入链拷贝规则追加）
    /// - `src`: 源链首节点
    /// - `src_off`: 源链窗口内的起始偏移
    /// - `n`: 复制的字节数
    ///
    /// # 说明
    /// 广播 / 组播扇出用它为每个接收方制作独立副本，
    /// 链从不跨套接字共享
    pub fn chain_copy(&mut self, dst: BufId, src: BufId, src_off: usize, n: usize) -> usize {
        let mut segments: Vec<(BufId, u16, u16)> = Vec::new();
        {
            let mut skip = src_off;
            let mut want = n;
            let mut cur = Some(src);
            while want > 0 {
                let id = match cur {
                    Some(id) => id,
                    None => break,
                };
                let node = self.node(id);
                let len = node.data_len as usize;
                if skip < len {
                    let take = core::cmp::min(len - skip, want);
                    segments.push((id, (node.data_off as usize + skip) as u16, take as u16));
                    want -= take;
                    skip = 0;
                } else {
                    skip -= len;
                }
                cur = node.next_buffer;
            }
        }

        let mut copied = 0;
        let mut tmp = [0u8; NET_BUFFER_SIZE];
        for (id, start, len) in segments {
            let mut done = 0usize;
            while done < len as usize {
                let take = core::cmp::min(NET_BUFFER_SIZE, len as usize - done);
                {
                    let node = self.node(id);
                    let base = start as usize + done;
                    match &node.external {
                        Some(ext) => tmp[..take].copy_from_slice(&ext[base..base + take]),
                        None => tmp[..take].copy_from_slice(&node.packet[base..base + take]),
                    }
                }
                copied += self.copy_in(dst, &tmp[..take], false);
                done += take;
            }
        }
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ip_checksum;

    fn read_all(pool: &BufferPool, head: BufId) -> Vec<u8> {
        let total = pool.node(head).total_len as usize;
        let mut out = Vec::new();
        pool.for_each_segment(head, 0, total, |seg| out.extend_from_slice(seg));
        out
    }

    #[test]
    fn test_copy_in_spans_nodes_with_checksum() {
        let mut pool = BufferPool::new(8);

        // 奇数长度、跨 3 个节点
        let payload: Vec<u8> = (0..(NET_BUFFER_SIZE * 2 + 33))
            .map(|i| (i * 13 + 5) as u8)
            .collect();
        let head = pool.chain_dequeue(0, payload.len()).unwrap();

        let copied = pool.copy_in(head, &payload, true);
        assert_eq!(copied, payload.len());
        assert_eq!(pool.node(head).total_len as usize, payload.len());
        assert_eq!(read_all(&pool, head), payload);

        // 链上折叠出的校验和与整段参考实现一致
        assert_eq!(pool.node(head).acc.finish(), ip_checksum(&payload));
        assert!(pool.node(head).flags.contains(BufFlags::SUM));
    }

    #[test]
    fn test_copy_in_odd_carry_across_calls() {
        let mut pool = BufferPool::new(8);

        let payload: Vec<u8> = (0..101).map(|i| (i * 7 + 1) as u8).collect();
        let head = pool.chain_dequeue(0, payload.len()).unwrap();

        // 奇数位置切开分两次拷入，校验和必须与一次性计算一致
        pool.copy_in(head, &payload[..33], true);
        pool.copy_in(head, &payload[33..], true);

        assert_eq!(read_all(&pool, head), payload);
        assert_eq!(pool.node(head).acc.finish(), ip_checksum(&payload));
    }

    #[test]
    fn test_copy_out_streams_destructively() {
        let mut pool = BufferPool::new(8);

        let payload: Vec<u8> = (0..(NET_BUFFER_SIZE + 40)).map(|i| i as u8).collect();
        let head = pool.chain_dequeue(0, payload.len()).unwrap();
        pool.copy_in(head, &payload, false);

        let mut first = alloc::vec![0u8; 50];
        assert_eq!(pool.copy_out(head, &mut first, 50), 50);
        assert_eq!(&first[..], &payload[..50]);
        assert_eq!(pool.node(head).total_len as usize, payload.len() - 50);

        // 继续读取剩余部分
        let rest_len = payload.len() - 50;
        let mut rest = alloc::vec![0u8; rest_len];
        assert_eq!(pool.copy_out(head, &mut rest, rest_len), rest_len);
        assert_eq!(&rest[..], &payload[50..]);
        assert_eq!(pool.node(head).total_len, 0);
    }

    #[test]
    fn test_zero_copy_frees_trailing_nodes() {
        let mut pool = BufferPool::new(8);

        // 为 3 个节点的容量分配链，零拷贝只占用 1 个节点
        let head = pool.chain_dequeue(0, NET_BUFFER_SIZE * 3).unwrap();
        assert_eq!(pool.used_count(), 3);

        let payload: Arc<[u8]> = (0..(NET_BUFFER_SIZE * 2))
            .map(|i| (i % 251) as u8)
            .collect::<Vec<u8>>()
            .into();
        let n = pool.zero_copy_in(head, payload.clone());
        assert_eq!(n, payload.len());

        // 首节点空置时挂接在首节点上，其余两个节点立即归还
        assert_eq!(pool.used_count(), 1);
        assert_eq!(pool.node(head).next_buffer, None);
        assert_eq!(read_all(&pool, head), payload[..].to_vec());
        assert_eq!(pool.used_count() + pool.total_free(), pool.capacity());
    }

    #[test]
    fn test_zero_copy_after_inline_header() {
        let mut pool = BufferPool::new(8);

        let head = pool.chain_dequeue(0, NET_BUFFER_SIZE * 2).unwrap();
        let header = [0xAAu8; 8];
        pool.copy_in(head, &header, false);

        let payload: Arc<[u8]> = alloc::vec![0x55u8; 60].into();
        pool.zero_copy_in(head, payload);

        let all = read_all(&pool, head);
        assert_eq!(&all[..8], &header);
        assert_eq!(&all[8..], &[0x55u8; 60][..]);
        assert_eq!(pool.node(head).total_len, 68);
    }

    #[test]
    fn test_chain_copy_duplicates_range() {
        let mut pool = BufferPool::new(12);

        let payload: Vec<u8> = (0..(NET_BUFFER_SIZE + 77)).map(|i| (i * 3) as u8).collect();
        let src = pool.chain_dequeue(0, payload.len()).unwrap();
        pool.copy_in(src, &payload, false);

        let dst = pool.chain_dequeue(0, payload.len() - 10).unwrap();
        let copied = pool.chain_copy(dst, src, 10, payload.len() - 10);
        assert_eq!(copied, payload.len() - 10);
        assert_eq!(read_all(&pool, dst), payload[10..].to_vec());

        // 源链窗口不受影响
        assert_eq!(read_all(&pool, src), payload);
    }

    #[test]
    fn test_chain_checksum_matches_reference() {
        let mut pool = BufferPool::new(8);

        let payload: Vec<u8> = (0..(NET_BUFFER_SIZE * 2 + 1)).map(|i| (i * 11) as u8).collect();
        let head = pool.chain_dequeue(0, payload.len()).unwrap();
        pool.copy_in(head, &payload, false);

        assert_eq!(pool.chain_checksum(head, 0), ip_checksum(&payload));
    }
}
