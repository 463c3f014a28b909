//! 每个基本流一个的有序数据包缓冲
//!
//! 队列本身不限容量，缓冲多少由协调器的阈值策略决定。所有操作都在队列自己的锁内完成，
//! 且都是 O(1)（clip_to / clear 除外）。需要同时查看多个队列时使用 [`PacketQueues::lock_all`]，
//! 固定按 视频 → 音频 → 字幕 的顺序加锁。

use crate::core::Packet;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Default)]
struct QueueInner {
    packets: VecDeque<Packet>,
    duration: f64,
    bytes: u64,
}

impl QueueInner {
    fn push(&mut self, packet: Packet) {
        self.duration += packet.duration;
        self.bytes += packet.size() as u64;
        self.packets.push_back(packet);
    }

    fn pop(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        if self.packets.is_empty() {
            // 避免浮点累计误差
            self.duration = 0.0;
            self.bytes = 0;
        } else {
            self.duration -= packet.duration;
            self.bytes -= packet.size() as u64;
        }
        Some(packet)
    }

    fn clear(&mut self) {
        self.packets.clear();
        self.duration = 0.0;
        self.bytes = 0;
    }
}

/// 线程安全的数据包队列
#[derive(Debug, Default)]
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    data_available: Condvar,
}

/// 持有队列锁期间的视图
pub struct PacketQueueGuard<'a> {
    inner: MutexGuard<'a, QueueInner>,
}

impl PacketQueueGuard<'_> {
    pub fn enqueue(&mut self, packet: Packet) {
        self.inner.push(packet);
    }

    pub fn dequeue(&mut self) -> Option<Packet> {
        self.inner.pop()
    }

    /// 丢弃时间戳早于 `time` 的前导数据包，返回裁剪后队列是否非空
    pub fn clip_to(&mut self, time: f64) -> bool {
        while self.inner.packets.front().map_or(false, |p| p.ts < time) {
            self.inner.pop();
        }
        !self.inner.packets.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn count(&self) -> usize {
        self.inner.packets.len()
    }

    pub fn duration(&self) -> f64 {
        self.inner.duration
    }

    pub fn byte_size(&self) -> u64 {
        self.inner.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.inner.packets.is_empty()
    }
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> PacketQueueGuard<'_> {
        PacketQueueGuard {
            inner: self.inner.lock(),
        }
    }

    /// 追加数据包（不阻塞）
    pub fn enqueue(&self, packet: Packet) {
        self.lock().enqueue(packet);
    }

    pub fn dequeue(&self) -> Option<Packet> {
        self.lock().dequeue()
    }

    /// 消费者使用：队列为空时最多等待 `timeout`，被 wake_all() 唤醒后重新检查
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Packet> {
        let mut inner = self.inner.lock();
        if inner.packets.is_empty() {
            self.data_available.wait_for(&mut inner, timeout);
        }
        inner.pop()
    }

    pub fn clip_to(&self, time: f64) -> bool {
        self.lock().clip_to(time)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn count(&self) -> usize {
        self.lock().count()
    }

    pub fn duration(&self) -> f64 {
        self.lock().duration()
    }

    pub fn byte_size(&self) -> u64 {
        self.lock().byte_size()
    }

    /// 唤醒所有等待数据的消费者
    pub fn wake_all(&self) {
        self.data_available.notify_all();
    }
}

/// 一个会话的三路队列
#[derive(Debug, Default)]
pub struct PacketQueues {
    pub video: PacketQueue,
    pub audio: PacketQueue,
    pub subtitle: PacketQueue,
}

/// 三路队列同时加锁后的视图
pub struct LockedQueues<'a> {
    pub video: PacketQueueGuard<'a>,
    pub audio: PacketQueueGuard<'a>,
    pub subtitle: PacketQueueGuard<'a>,
}

impl LockedQueues<'_> {
    /// 尝试在已缓冲数据内完成 Seek
    ///
    /// 只有视频或音频队列非空，且三路队列裁剪后都非空时才算成功。
    /// 短路求值：前面的队列裁剪失败时后面的队列不会被裁剪。
    pub fn clip_all_to(&mut self, time: f64) -> bool {
        (self.video.count() > 0 || self.audio.count() > 0)
            && self.video.clip_to(time)
            && self.audio.clip_to(time)
            && self.subtitle.clip_to(time)
    }

    pub fn clear_all(&mut self) {
        self.video.clear();
        self.audio.clear();
        self.subtitle.clear();
    }
}

impl PacketQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_all(&self) -> LockedQueues<'_> {
        LockedQueues {
            video: self.video.lock(),
            audio: self.audio.lock(),
            subtitle: self.subtitle.lock(),
        }
    }

    pub fn clear_all(&self) {
        self.lock_all().clear_all();
    }

    pub fn wake_all(&self) {
        self.video.wake_all();
        self.audio.wake_all();
        self.subtitle.wake_all();
    }
}
