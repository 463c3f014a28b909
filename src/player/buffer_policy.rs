//! 缓冲判断（纯函数）
//!
//! "活动" 指会话当前绑定了对应的消费者，与队列里有没有数据无关。

use crate::player::session::Consumers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveStreams {
    pub video: bool,
    pub audio: bool,
}

impl ActiveStreams {
    pub fn from_consumers(consumers: &Consumers) -> Self {
        Self {
            video: consumers.video.is_some(),
            audio: consumers.audio.is_some(),
        }
    }
}

/// 每个活动流都至少缓冲了 `min` 个包
pub fn buffered_packets(active: ActiveStreams, video: usize, audio: usize, min: usize) -> bool {
    match (active.video, active.audio) {
        (true, true) => video >= min && audio >= min,
        (false, true) => audio >= min,
        (true, false) => video >= min,
        (false, false) => false,
    }
}

/// 至少一个活动流的队列为空
pub fn empty_buffers(active: ActiveStreams, video: usize, audio: usize) -> bool {
    match (active.video, active.audio) {
        (true, true) => video == 0 || audio == 0,
        (false, true) => audio == 0,
        (true, false) => video == 0,
        (false, false) => false,
    }
}

/// 所有活动消费者都已空闲，可以结束
pub fn can_break(consumers: &Consumers) -> bool {
    consumers.iter().all(|c| c.is_idle())
}

/// 已缓冲时长：优先用视频队列，视频为空或没有时长信息时用音频队列
pub fn buffered_time(video_count: usize, video_time: f64, audio_time: f64) -> f64 {
    if video_count > 0 && video_time > 0.0 {
        video_time
    } else {
        audio_time
    }
}
