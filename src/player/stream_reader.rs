use crate::core::{Chapter, Packet, Result, StreamInfo, Tag};
use bytes::Bytes;
use std::sync::Arc;

/// 可中止的阻塞操作
///
/// 由 AbortGate 持有，在任意线程调用 abort() 让正在阻塞的 read/seek/open 尽快返回。
pub trait AbortHandle: Send + Sync {
    fn abort(&self);
}

/// 读取到的数据包及其所属流
#[derive(Debug, Clone)]
pub struct ReadPacket {
    /// 流索引；None 表示无法归属到任何流
    pub stream: Option<usize>,
    pub packet: Packet,
}

/// 解封装器抽象接口
///
/// 负责把 URL 变成带类型的数据包；容器解析本身不在本 crate 内实现。
/// 所有方法都在生产者线程上调用，只有 [`AbortHandle`] 会被其它线程使用。
pub trait StreamReader: Send {
    /// 打开 URL（阻塞，可被中止）
    fn open(&mut self, url: &str) -> Result<()>;

    /// 读取下一个数据包（阻塞，可被中止）
    ///
    /// 返回 None 表示没有更多数据（EOF、读取错误或已中止）
    fn read(&mut self) -> Option<ReadPacket>;

    /// Seek 到指定位置（秒），成功返回 true
    fn seek(&mut self, target: f64, backwards: bool) -> bool;

    /// 获取中止句柄（供 AbortGate 在其它线程调用）
    fn abort_handle(&self) -> Arc<dyn AbortHandle>;

    /// 暂停读取（网络源可借此暂停连接）
    fn pause(&mut self) {}

    /// 总时长（秒）；None 表示未知
    fn length(&self) -> Option<f64>;

    /// 码率（kbps），未知为 0
    fn bitrate(&self) -> u64 {
        0
    }

    fn streams_info(&self) -> Vec<StreamInfo>;

    fn tags(&self) -> Vec<Tag> {
        Vec::new()
    }

    fn chapters(&self) -> Vec<Chapter> {
        Vec::new()
    }

    /// 元数据自上次查询后是否变化（查询会清除标记）
    fn metadata_changed(&mut self) -> bool {
        false
    }

    /// 是否为本地源
    fn local_stream(&self) -> bool;

    /// 源自带节奏控制（如直播），不需要缓冲
    fn dont_use_buffer(&self) -> bool {
        false
    }

    /// ReplayGain：(增益 dB, 峰值)；不可用时返回 None
    fn replay_gain(&self, _album: bool) -> Option<(f32, f32)> {
        None
    }

    /// 封面图片；embedded_only 为 true 时只返回内嵌封面
    fn cover_image(&self, _embedded_only: bool) -> Option<Bytes> {
        None
    }

    /// 格式名称
    fn name(&self) -> String;

    /// 获取描述信息（用于调试）
    fn description(&self) -> String {
        self.name()
    }
}
