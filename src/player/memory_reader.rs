//! 基于内存数据包脚本的 StreamReader
//!
//! 用于演示程序和测试：按顺序返回预先准备好的数据包，支持 Seek、暂停和中止，
//! 可以模拟网络源的读取延迟和直播源在末尾的无限等待。

use crate::core::{Chapter, DemuxError, Packet, Result, StreamInfo, Tag};
use crate::player::stream_reader::{AbortHandle, ReadPacket, StreamReader};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 数据包脚本及源属性
#[derive(Debug, Clone)]
pub struct MemorySource {
    pub name: String,
    pub streams: Vec<StreamInfo>,
    /// (流索引, 数据包)；流索引为 None 表示无法归属
    pub packets: Vec<(Option<usize>, Packet)>,
    pub tags: Vec<Tag>,
    /// 读到指定包序号时替换标签并标记元数据变化
    pub tag_updates: Vec<(usize, Vec<Tag>)>,
    pub chapters: Vec<Chapter>,
    pub length: Option<f64>,
    pub bitrate: u64,
    pub local: bool,
    pub dont_use_buffer: bool,
    pub replay_gain: Option<(f32, f32)>,
    pub cover: Option<Bytes>,
    /// open() 失败
    pub fail_open: bool,
    /// open() 阻塞直到被中止
    pub block_open: bool,
    /// 每次 read() 前的延迟
    pub read_delay: Option<Duration>,
    /// 读完后阻塞直到被中止（模拟直播）
    pub hold_at_end: bool,
    /// seek() 返回前的延迟
    pub seek_delay: Option<Duration>,
    pub seekable: bool,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            streams: Vec::new(),
            packets: Vec::new(),
            tags: Vec::new(),
            tag_updates: Vec::new(),
            chapters: Vec::new(),
            length: None,
            bitrate: 0,
            local: true,
            dont_use_buffer: false,
            replay_gain: None,
            cover: None,
            fail_open: false,
            block_open: false,
            read_delay: None,
            hold_at_end: false,
            seek_delay: None,
            seekable: true,
        }
    }
}

impl MemorySource {
    /// 交错的音视频数据包：视频 `fps` 帧/秒，音频每包 `audio_packet_secs` 秒，共 `seconds` 秒
    pub fn interleaved(seconds: f64, fps: f64, audio_packet_secs: f64) -> Self {
        let mut packets = Vec::new();
        let video_step = 1.0 / fps;
        let (mut video_index, mut audio_index) = (0u32, 0u32);
        loop {
            let vt = video_index as f64 / fps;
            let at = audio_index as f64 * audio_packet_secs;
            if vt >= seconds && at >= seconds {
                break;
            }
            if (vt <= at && vt < seconds) || at >= seconds {
                packets.push((Some(0), Packet::new(vec![0u8; 1024], vt, video_step)));
                video_index += 1;
            } else {
                packets.push((Some(1), Packet::new(vec![0u8; 256], at, audio_packet_secs)));
                audio_index += 1;
            }
        }
        Self {
            streams: vec![StreamInfo::video(640, 360, fps), StreamInfo::audio(48000, 2)],
            packets,
            length: Some(seconds),
            ..Self::default()
        }
    }
}

/// 读取过程的统计，测试用
#[derive(Debug, Default)]
pub struct MemoryReaderStats {
    pub reads: AtomicUsize,
    pub pauses: AtomicUsize,
    pub seeks: Mutex<Vec<(f64, bool)>>,
    pub dropped: AtomicBool,
}

#[derive(Default)]
struct MemoryAbort {
    aborted: Mutex<bool>,
    cond: Condvar,
}

impl MemoryAbort {
    fn is_aborted(&self) -> bool {
        *self.aborted.lock()
    }

    /// 等待 `timeout`（None 表示一直等），返回是否被中止
    fn sleep(&self, timeout: Option<Duration>) -> bool {
        let mut aborted = self.aborted.lock();
        if !*aborted {
            match timeout {
                Some(timeout) => {
                    self.cond.wait_for(&mut aborted, timeout);
                }
                None => {
                    while !*aborted {
                        self.cond.wait(&mut aborted);
                    }
                }
            }
        }
        *aborted
    }
}

impl AbortHandle for MemoryAbort {
    fn abort(&self) {
        *self.aborted.lock() = true;
        self.cond.notify_all();
    }
}

pub struct MemoryReader {
    source: MemorySource,
    position: usize,
    opened: bool,
    metadata_changed: bool,
    abort: Arc<MemoryAbort>,
    stats: Arc<MemoryReaderStats>,
}

impl MemoryReader {
    pub fn new(source: MemorySource) -> Self {
        Self {
            source,
            position: 0,
            opened: false,
            metadata_changed: false,
            abort: Arc::default(),
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> Arc<MemoryReaderStats> {
        self.stats.clone()
    }
}

impl StreamReader for MemoryReader {
    fn open(&mut self, url: &str) -> Result<()> {
        if self.source.block_open {
            self.abort.sleep(None);
        }
        if self.abort.is_aborted() || self.source.fail_open {
            return Err(DemuxError::OpenFailed { url: url.to_string() });
        }
        self.opened = true;
        Ok(())
    }

    fn read(&mut self) -> Option<ReadPacket> {
        if !self.opened || self.abort.is_aborted() {
            return None;
        }
        if let Some(delay) = self.source.read_delay {
            if self.abort.sleep(Some(delay)) {
                return None;
            }
        }
        let Some((stream, packet)) = self.source.packets.get(self.position).cloned() else {
            if self.source.hold_at_end {
                self.abort.sleep(None);
            }
            return None;
        };
        if let Some((_, tags)) = self.source.tag_updates.iter().find(|(at, _)| *at == self.position) {
            self.source.tags = tags.clone();
            self.metadata_changed = true;
        }
        self.position += 1;
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        Some(ReadPacket { stream, packet })
    }

    fn seek(&mut self, target: f64, backwards: bool) -> bool {
        self.stats.seeks.lock().push((target, backwards));
        if !self.opened || !self.source.seekable || self.abort.is_aborted() {
            return false;
        }
        if let Some(delay) = self.source.seek_delay {
            if self.abort.sleep(Some(delay)) {
                return false;
            }
        }
        let packets = &self.source.packets;
        self.position = if backwards {
            packets.iter().rposition(|(_, p)| p.ts <= target).unwrap_or(0)
        } else {
            packets
                .iter()
                .position(|(_, p)| p.ts >= target)
                .unwrap_or(packets.len())
        };
        true
    }

    fn abort_handle(&self) -> Arc<dyn AbortHandle> {
        self.abort.clone()
    }

    fn pause(&mut self) {
        self.stats.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn length(&self) -> Option<f64> {
        self.source.length
    }

    fn bitrate(&self) -> u64 {
        self.source.bitrate
    }

    fn streams_info(&self) -> Vec<StreamInfo> {
        self.source.streams.clone()
    }

    fn tags(&self) -> Vec<Tag> {
        self.source.tags.clone()
    }

    fn chapters(&self) -> Vec<Chapter> {
        self.source.chapters.clone()
    }

    fn metadata_changed(&mut self) -> bool {
        std::mem::take(&mut self.metadata_changed)
    }

    fn local_stream(&self) -> bool {
        self.source.local
    }

    fn dont_use_buffer(&self) -> bool {
        self.source.dont_use_buffer
    }

    fn replay_gain(&self, _album: bool) -> Option<(f32, f32)> {
        self.source.replay_gain
    }

    fn cover_image(&self, _embedded_only: bool) -> Option<Bytes> {
        self.source.cover.clone()
    }

    fn name(&self) -> String {
        self.source.name.clone()
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.stats.dropped.store(true, Ordering::SeqCst);
    }
}
