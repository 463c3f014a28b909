//! 会话共享状态
//!
//! 协调器、消费者和外部调度者通过同一个 [`PlaybackSession`] 协作。每个字段注明了谁可以写、
//! 在哪把锁下写；原子字段不需要额外的锁。

use crate::core::StreamInfo;
use crate::player::abort_gate::AbortGate;
use crate::player::consumer::ConsumerHandle;
use crate::player::packet_queue::PacketQueues;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 以位模式存储的 f64 原子量
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }
}

/// 待处理的 Seek 请求；同一时间最多一个，新请求覆盖旧请求
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SeekRequest {
    #[default]
    None,
    /// Seek 到指定秒数
    To(f64),
    /// 切换流之后重新 Seek 到当前位置（不允许在缓冲内完成）
    CurrentPosition,
}

impl SeekRequest {
    pub fn is_pending(&self) -> bool {
        !matches!(self, SeekRequest::None)
    }
}

/// 请求槽：每个新请求递增 generation
#[derive(Debug, Default)]
struct SeekSlot {
    request: SeekRequest,
    generation: u64,
}

/// 协调器取走的 Seek 请求
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ResolvedSeek {
    pub target: f64,
    /// 切换流之后的重新 Seek，不允许在缓冲内完成
    pub no_seek_in_buffer: bool,
    pub generation: u64,
}

/// 流选择
///
/// `audio` / `video` / `subtitle` 是当前绑定的流，只由 StreamBinder 写；
/// `chosen_*` 是外部请求切换到的流，由调度者写。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSelection {
    pub audio: Option<usize>,
    pub video: Option<usize>,
    pub subtitle: Option<usize>,
    pub chosen_audio: Option<usize>,
    pub chosen_video: Option<usize>,
    pub chosen_subtitle: Option<usize>,
    /// 强制重新加载
    pub reload: bool,
}

impl StreamSelection {
    /// 请求的流与当前绑定的流不一致，或已要求重新加载
    pub fn needs_reload(&self) -> bool {
        fn differs(chosen: Option<usize>, current: Option<usize>) -> bool {
            chosen.is_some() && chosen != current
        }
        self.reload
            || differs(self.chosen_audio, self.audio)
            || differs(self.chosen_video, self.video)
            || differs(self.chosen_subtitle, self.subtitle)
    }

    pub fn has_av(&self) -> bool {
        self.audio.is_some() || self.video.is_some()
    }
}

/// 当前活动的消费者
#[derive(Clone, Default)]
pub struct Consumers {
    pub audio: Option<Arc<dyn ConsumerHandle>>,
    pub video: Option<Arc<dyn ConsumerHandle>>,
}

impl Consumers {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ConsumerHandle>> {
        self.audio.iter().chain(self.video.iter())
    }

    /// 下游输出全部可写
    pub fn sinks_ready(&self) -> bool {
        self.iter().all(|c| c.sink_ready())
    }
}

/// 在所属上下文上重新绑定流
///
/// 根据 `chosen_*` 选定流、创建或替换消费者，并调用 [`PlaybackSession::bind_streams`] 写回结果。
pub trait StreamBinder: Send + Sync {
    fn bind(&self, streams: &[StreamInfo], session: &PlaybackSession) -> bool;
}

/// 一次播放会话的共享状态
#[derive(Default)]
pub struct PlaybackSession {
    /// 生产者写，消费者读；各队列自带锁
    pub queues: PacketQueues,
    /// stop() 使用的中止标记
    pub gate: AbortGate,

    /// StreamBinder / 调度者写
    selection: Mutex<StreamSelection>,
    /// StreamBinder 写
    consumers: RwLock<Consumers>,
    /// 调度者写，协调器解析后清除
    seek: Mutex<SeekSlot>,
    /// 调度者写；协调器在 Seek 完成后清除
    paused: AtomicBool,
    /// 协调器写
    end_of_stream: AtomicBool,
    /// 协调器写，消费者读：为 true 时消费者不应被唤醒
    wait_for_data: AtomicBool,
    /// 协调器写：Seek 期间为 false
    can_update_pos: AtomicBool,
    /// 消费者写：最后已知的播放位置（秒）
    position: AtomicF64,
    /// 协调器 / 消费者写：视频帧间隔提示（秒）
    frame_last_delay: AtomicF64,
    /// 协调器写
    replay_gain: AtomicF64,
    /// 消费者写，协调器在 flush 时清零
    skip_audio_frame: AtomicF64,
    audio_current_pts: AtomicF64,
    /// 协调器写：外部字幕文件 URL
    file_subs: Mutex<Vec<String>>,

    /// 消费者请求更多数据（缓冲区不再满）
    more_data: Mutex<bool>,
    more_data_cond: Condvar,
}

impl PlaybackSession {
    pub fn new() -> Arc<Self> {
        let session = Self::default();
        session.replay_gain.store(1.0);
        session.can_update_pos.store(true, Ordering::SeqCst);
        Arc::new(session)
    }

    // ---------- 调度者接口 ----------

    pub fn request_seek(&self, target: f64) {
        self.replace_seek(SeekRequest::To(target.max(0.0)));
    }

    pub fn request_reseek(&self) {
        self.replace_seek(SeekRequest::CurrentPosition);
    }

    fn replace_seek(&self, request: SeekRequest) {
        {
            let mut slot = self.seek.lock();
            slot.request = request;
            slot.generation += 1;
        }
        self.notify_control();
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.notify_control();
    }

    pub fn choose_audio(&self, index: Option<usize>) {
        self.selection.lock().chosen_audio = index;
        self.notify_control();
    }

    pub fn choose_video(&self, index: Option<usize>) {
        self.selection.lock().chosen_video = index;
        self.notify_control();
    }

    pub fn choose_subtitle(&self, index: Option<usize>) {
        self.selection.lock().chosen_subtitle = index;
        self.notify_control();
    }

    pub fn request_reload(&self) {
        self.selection.lock().reload = true;
        self.notify_control();
    }

    /// 线程安全、幂等；生产者循环最多再执行一轮
    pub fn stop(&self) {
        self.gate.abort();
        self.notify_control();
        self.queues.wake_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.gate.is_aborted()
    }

    // ---------- StreamBinder 接口 ----------

    /// 写回绑定结果，并清除重新加载标记
    pub fn bind_streams(
        &self,
        audio: Option<usize>,
        video: Option<usize>,
        subtitle: Option<usize>,
        consumers: Consumers,
    ) {
        {
            let mut selection = self.selection.lock();
            selection.audio = audio;
            selection.video = video;
            selection.subtitle = subtitle;
            selection.reload = false;
        }
        *self.consumers.write() = consumers;
    }

    // ---------- 消费者接口 ----------

    /// 缓冲区不再满，唤醒生产者继续读取
    pub fn request_more_data(&self) {
        *self.more_data.lock() = true;
        self.more_data_cond.notify_all();
    }

    pub fn set_position(&self, seconds: f64) {
        self.position.store(seconds);
    }

    pub fn set_audio_current_pts(&self, pts: f64) {
        self.audio_current_pts.store(pts);
    }

    pub fn set_skip_audio_frame(&self, seconds: f64) {
        self.skip_audio_frame.store(seconds);
    }

    // ---------- 读取 ----------

    pub fn selection(&self) -> StreamSelection {
        self.selection.lock().clone()
    }

    pub fn consumers(&self) -> Consumers {
        self.consumers.read().clone()
    }

    pub fn seek_request(&self) -> SeekRequest {
        self.seek.lock().request
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::SeqCst)
    }

    pub fn wait_for_data(&self) -> bool {
        self.wait_for_data.load(Ordering::SeqCst)
    }

    pub fn can_update_pos(&self) -> bool {
        self.can_update_pos.load(Ordering::SeqCst)
    }

    pub fn position(&self) -> f64 {
        self.position.load()
    }

    pub fn frame_last_delay(&self) -> f64 {
        self.frame_last_delay.load()
    }

    pub fn replay_gain(&self) -> f64 {
        self.replay_gain.load()
    }

    pub fn skip_audio_frame(&self) -> f64 {
        self.skip_audio_frame.load()
    }

    pub fn audio_current_pts(&self) -> f64 {
        self.audio_current_pts.load()
    }

    pub fn file_subs(&self) -> Vec<String> {
        self.file_subs.lock().clone()
    }

    // ---------- 协调器内部使用 ----------

    pub(crate) fn mark_reload(&self) -> bool {
        let mut selection = self.selection.lock();
        if selection.needs_reload() {
            selection.reload = true;
            true
        } else {
            false
        }
    }

    /// 把 CurrentPosition 解析成具体目标；没有请求时返回 None
    pub(crate) fn resolve_seek(&self) -> Option<ResolvedSeek> {
        let mut slot = self.seek.lock();
        let (target, no_seek_in_buffer) = match slot.request {
            SeekRequest::None => return None,
            SeekRequest::To(target) => (target, false),
            SeekRequest::CurrentPosition => {
                let target = self.position.load();
                slot.request = SeekRequest::To(target);
                (target, true)
            }
        };
        Some(ResolvedSeek {
            target,
            no_seek_in_buffer,
            generation: slot.generation,
        })
    }

    /// 清除已处理的请求；处理期间到达的新请求保留，返回 false
    pub(crate) fn finish_seek(&self, resolved: &ResolvedSeek) -> bool {
        let mut slot = self.seek.lock();
        if slot.generation == resolved.generation {
            slot.request = SeekRequest::None;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear_paused(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_end_of_stream(&self, value: bool) {
        self.end_of_stream.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_wait_for_data(&self, value: bool) {
        self.wait_for_data.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_can_update_pos(&self, value: bool) {
        self.can_update_pos.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_frame_last_delay(&self, seconds: f64) {
        self.frame_last_delay.store(seconds);
    }

    pub(crate) fn set_replay_gain(&self, gain: f64) {
        self.replay_gain.store(gain);
    }

    pub(crate) fn reset_audio_accumulators(&self) {
        self.skip_audio_frame.store(0.0);
        self.audio_current_pts.store(0.0);
    }

    pub(crate) fn add_file_subs(&self, urls: &[String]) -> Vec<String> {
        let mut list = self.file_subs.lock();
        for url in urls {
            if !list.contains(url) {
                list.push(url.clone());
            }
        }
        list.clone()
    }

    pub(crate) fn take_consumers(&self) -> Consumers {
        std::mem::take(&mut *self.consumers.write())
    }

    /// 等待消费者请求更多数据，最多等 `timeout`；控制请求也会提前唤醒
    ///
    /// 返回 true 表示收到了请求（并消费掉该请求）
    pub(crate) fn wait_more_data(&self, timeout: Duration) -> bool {
        let mut more = self.more_data.lock();
        if !*more {
            self.more_data_cond.wait_for(&mut more, timeout);
        }
        std::mem::replace(&mut *more, false)
    }

    fn notify_control(&self) {
        // 持锁通知，避免与 wait_more_data 的检查错过
        let _more = self.more_data.lock();
        self.more_data_cond.notify_all();
    }

    /// 唤醒等待数据的消费者
    pub(crate) fn wake_consumers(&self) {
        self.queues.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_needs_reload_on_changed_choice() {
        let mut selection = StreamSelection {
            audio: Some(1),
            video: Some(0),
            ..Default::default()
        };
        assert!(!selection.needs_reload());
        selection.chosen_audio = Some(1);
        assert!(!selection.needs_reload());
        selection.chosen_audio = Some(2);
        assert!(selection.needs_reload());
        selection.chosen_audio = None;
        selection.chosen_subtitle = Some(3);
        assert!(selection.needs_reload());
    }

    #[test]
    fn test_reseek_resolves_to_current_position() {
        let session = PlaybackSession::new();
        assert_eq!(session.resolve_seek(), None);
        session.set_position(42.5);
        session.request_reseek();
        let resolved = session.resolve_seek().unwrap();
        assert_eq!((resolved.target, resolved.no_seek_in_buffer), (42.5, true));
        // 已解析为具体目标
        assert_eq!(session.seek_request(), SeekRequest::To(42.5));
        assert!(session.finish_seek(&resolved));
        assert!(!session.seek_request().is_pending());
    }

    #[test]
    fn test_newer_seek_replaces_older() {
        let session = PlaybackSession::new();
        session.request_seek(10.0);
        session.request_seek(20.0);
        let resolved = session.resolve_seek().unwrap();
        assert_eq!((resolved.target, resolved.no_seek_in_buffer), (20.0, false));
        session.request_seek(-5.0);
        assert_eq!(session.seek_request(), SeekRequest::To(0.0));
    }

    #[test]
    fn test_seek_arriving_during_handling_survives_finish() {
        let session = PlaybackSession::new();
        session.request_seek(5.0);
        let first = session.resolve_seek().unwrap();
        session.request_seek(12.0);
        assert!(!session.finish_seek(&first));
        assert_eq!(session.seek_request(), SeekRequest::To(12.0));

        let second = session.resolve_seek().unwrap();
        assert_eq!(second.target, 12.0);
        assert!(session.finish_seek(&second));
        assert!(!session.seek_request().is_pending());
    }

    #[test]
    fn test_same_target_requested_again_is_not_lost() {
        let session = PlaybackSession::new();
        session.request_seek(5.0);
        let first = session.resolve_seek().unwrap();
        session.request_seek(5.0);
        assert!(!session.finish_seek(&first));
        assert!(session.seek_request().is_pending());
    }

    #[test]
    fn test_bind_streams_clears_reload() {
        let session = PlaybackSession::new();
        session.choose_audio(Some(2));
        assert!(session.mark_reload());
        assert!(session.selection().reload);
        session.bind_streams(Some(2), None, None, Consumers::default());
        assert!(!session.selection().reload);
        assert!(!session.mark_reload());
    }

    #[test]
    fn test_more_data_request_is_consumed_once() {
        let session = PlaybackSession::new();
        session.request_more_data();
        assert!(session.wait_more_data(Duration::from_millis(1)));
        assert!(!session.wait_more_data(Duration::from_millis(1)));
    }

    #[test]
    fn test_control_change_wakes_backpressure_wait() {
        let session = PlaybackSession::new();
        let waiter = {
            let session = session.clone();
            thread::spawn(move || {
                let start = Instant::now();
                session.wait_more_data(Duration::from_secs(5));
                start.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(30));
        session.request_seek(3.0);
        assert!(waiter.join().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn test_file_subs_are_deduplicated() {
        let session = PlaybackSession::new();
        session.add_file_subs(&["file:///a.srt".to_string()]);
        let all = session.add_file_subs(&["file:///a.srt".to_string(), "file:///b.ass".to_string()]);
        assert_eq!(all, vec!["file:///a.srt".to_string(), "file:///b.ass".to_string()]);
    }
}
