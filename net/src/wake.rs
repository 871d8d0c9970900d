//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 延迟唤醒通道
//!
//! 中断上下文里归还缓冲区时不能直接调用调度器。归还方只向这条
//! 有界单消费者通道投递一条"唤醒一个等待者"的消息；唤醒工作者
//! 在任务可以安全调度的上下文里消费消息，取出挂起队列头部的
//! 任务并恢复它。内存操作与调度器调用由此解耦

use alloc::collections::VecDeque;
use spin::Mutex;

use crate::buffer::BufferPool;

/// 唤醒消息
///
/// 语义固定为"恢复挂起队列头部的一个等待者"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeMsg;

/// 有界单消费者唤醒通道
pub struct WakeChannel {
    queue: Mutex<VecDeque<WakeMsg>>,
    capacity: usize,
}

impl WakeChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// 投递一条唤醒消息
    ///
    /// 通道满时丢弃消息；生产方处在临界区内，绝不阻塞
    pub fn post(&self) {
        let mut q = self.queue.lock();
        if q.len() < self.capacity {
            q.push_back(WakeMsg);
        } else {
            log::warn!("wake channel full, wake message dropped");
        }
    }

    /// 消费一条唤醒消息
    pub fn take(&self) -> Option<WakeMsg> {
        self.queue.lock().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// 唤醒工作者
///
/// 延迟中断上下文的宿主：优先级高于任务、低于硬件中断，
/// 自身永不阻塞
pub struct WakeWorker {
    channel: alloc::sync::Arc<WakeChannel>,
}

impl WakeWorker {
    pub fn new(channel: alloc::sync::Arc<WakeChannel>) -> Self {
        Self { channel }
    }

    /// 处理一条唤醒消息
    ///
    /// # 返回
    /// 是否恢复了一个等待者
    ///
    /// # 说明
    /// 只恢复挂起队列头部的那一个任务；`resume` 在池锁之外调用
    pub fn service(&self, pool: &Mutex<BufferPool>) -> bool {
        if self.channel.take().is_none() {
            return false;
        }

        let waiter = pool.lock().take_head_waiter();
        match waiter {
            Some(task) => {
                task.resume();
                true
            }
            None => false,
        }
    }

    /// 处理当前积压的全部唤醒消息
    pub fn drain(&self, pool: &Mutex<BufferPool>) -> usize {
        let mut resumed = 0;
        while self.service(pool) {
            resumed += 1;
        }
        resumed
    }
}
