use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 压缩数据包
///
/// 由 StreamReader::read() 产生，入队后归 PacketQueue 所有，直到被消费者取走。
/// 时间单位统一为秒。
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub data: Bytes,
    pub ts: f64,        // 显示时间戳（秒）
    pub duration: f64,  // 持续时间（秒）
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, ts: f64, duration: f64) -> Self {
        Self {
            data: data.into(),
            ts,
            duration,
        }
    }

    /// 负载大小（字节）
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 基本流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Attachment,
    Unknown,
}

/// 基本流描述（由 StreamReader::streams_info() 提供）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub kind: StreamKind,
    pub codec: String,
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u64,
    pub tags: Vec<Tag>,
}

impl StreamInfo {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            codec: String::new(),
            title: String::new(),
            width: 0,
            height: 0,
            fps: 0.0,
            sample_rate: 0,
            channels: 0,
            bitrate: 0,
            tags: Vec::new(),
        }
    }

    pub fn video(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            ..Self::new(StreamKind::Video)
        }
    }

    pub fn audio(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            ..Self::new(StreamKind::Audio)
        }
    }
}

/// 元数据标签（键, 值）
pub type Tag = (String, String);

/// 章节
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub start: f64,
    pub title: String,
}

/// 当前曲目的元数据（标题 / 艺术家 / 专辑）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
}

impl TrackMetadata {
    /// 从标签列表中提取标题、艺术家和专辑；键不区分大小写，后出现的覆盖先出现的
    pub fn from_tags(tags: &[Tag]) -> Self {
        let mut metadata = Self::default();
        for (key, value) in tags {
            match key.to_ascii_lowercase().as_str() {
                "title" => metadata.title = value.clone(),
                "artist" => metadata.artist = value.clone(),
                "album" => metadata.album = value.clone(),
                _ => {}
            }
        }
        metadata
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.artist.is_empty() && self.album.is_empty()
    }
}

/// 播放状态文本（具体文案由表现层决定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Opening,
    Buffering,
    Playing,
    Paused,
    Seeking,
}

/// 协调器内部阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Opening,
    StreamDiscovery,
    Filling,
    Steady,
    Seeking,
    Paused,
    EndOfStream,
    Closing,
    Terminated,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Opening => "OPENING",
            Phase::StreamDiscovery => "STREAM_DISCOVERY",
            Phase::Filling => "FILLING",
            Phase::Steady => "STEADY",
            Phase::Seeking => "SEEKING",
            Phase::Paused => "PAUSED",
            Phase::EndOfStream => "END_OF_STREAM",
            Phase::Closing => "CLOSING",
            Phase::Terminated => "TERMINATED",
            Phase::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Terminated | Phase::Error)
    }
}

/// 发往会话所有者的通知
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// 状态文本变化
    Status(PlaybackStatus),
    /// 当前条目开始播放（打开阶段）
    SetCurrentPlaying,
    /// 已缓冲秒数（四舍五入）
    BufferedSeconds(f64),
    /// 已缓冲字节数与秒数
    Buffered { bytes: u64, seconds: f64 },
    /// 播放 / 暂停切换
    PlayStateChanged(bool),
    /// 总时长（未知时为 0）
    LengthChanged(f64),
    /// 正在播放的曲目信息；playing == false 时为会话结束通知
    Playing {
        playing: bool,
        metadata: TrackMetadata,
        length: f64,
        needs_cover: bool,
    },
    /// 无法打开（已去掉 file:// 前缀）
    OpenFailed { url: String },
    /// 缓冲内 Seek 后清除待渲染的字幕事件
    FlushSubtitleEvents,
    /// 找到的外部字幕文件
    SubtitleFilesFound(Vec<String>),
    /// 协调器阶段变化
    PhaseChanged(Phase),
}

/// 正常结束的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// 读取完毕且缓冲已排空
    EndOfStream,
    /// 被 stop() 中止
    Stopped,
}

/// 缓冲快照（用于监控和调试）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BufferStatus {
    pub video_packets: usize,
    pub audio_packets: usize,
    pub bytes: u64,
    pub seconds: f64,
}
