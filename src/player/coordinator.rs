//! 解封装缓冲协调器
//!
//! 生产者线程上的主循环：打开源、发现流、读取数据包并分发到各流队列，根据缓冲占用、
//! 消费者状态和时间决定何时开始、暂停、恢复、Seek 或结束。
//!
//! 阶段：OPENING → STREAM_DISCOVERY → FILLING ⇄ STEADY（可重入 SEEKING / PAUSED）
//! → END_OF_STREAM → CLOSING → TERMINATED（或 ERROR）。

use crate::core::{
    Completion, CoordinatorConfig, DemuxError, Phase, PlaybackStatus, Result, SessionEvent,
    StreamKind, TrackMetadata,
};
use crate::player::buffer_policy::{self, ActiveStreams};
use crate::player::consumer::ConsumerLock;
use crate::player::external_subtitle::ExternalSubtitleFinder;
use crate::player::reader_factory::{self, ReaderFactory, UrlResolver};
use crate::player::replay_gain;
use crate::player::session::{Consumers, PlaybackSession, SeekRequest, StreamBinder};
use crate::player::stream_reader::{ReadPacket, StreamReader};
use crate::player::teardown::{OwnerHandle, TeardownRendezvous};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 主循环内跨迭代保存的状态
struct LoopState {
    paused: bool,
    reader_paused: bool,
    last_report: Instant,
    force_report: bool,
    buffered: u64,
    last_buffered: u64,
    buffered_time: f64,
}

/// 一次迭代的缓冲快照
struct Snapshot {
    video: usize,
    audio: usize,
}

pub struct DemuxCoordinator {
    url: String,
    name: Option<String>,
    config: CoordinatorConfig,
    session: Arc<PlaybackSession>,
    factory: Arc<dyn ReaderFactory>,
    resolver: Option<Arc<dyn UrlResolver>>,
    binder: Arc<dyn StreamBinder>,
    owner: OwnerHandle,
    rendezvous: TeardownRendezvous,
    events: Sender<SessionEvent>,
    phase: Phase,
    metadata: TrackMetadata,
    /// 未知时长时置 0
    play_if_buffered: f64,
    update_buffered_seconds: bool,
}

impl DemuxCoordinator {
    pub fn new(
        url: impl Into<String>,
        session: Arc<PlaybackSession>,
        factory: Arc<dyn ReaderFactory>,
        binder: Arc<dyn StreamBinder>,
        owner: OwnerHandle,
        events: Sender<SessionEvent>,
    ) -> Self {
        let config = CoordinatorConfig::default();
        Self {
            url: url.into(),
            name: None,
            play_if_buffered: config.play_if_buffered_secs,
            update_buffered_seconds: config.update_buffered_seconds,
            config,
            session,
            factory,
            resolver: None,
            binder,
            rendezvous: TeardownRendezvous::new(owner.clone()),
            owner,
            events,
            phase: Phase::Opening,
            metadata: TrackMetadata::default(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.play_if_buffered = config.play_if_buffered_secs;
        self.update_buffered_seconds = config.update_buffered_seconds;
        self.config = config;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn UrlResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn session(&self) -> &Arc<PlaybackSession> {
        &self.session
    }

    /// 运行整个会话，返回时 StreamReader 已经销毁
    ///
    /// stop() 中止的会话返回 `Ok(Completion::Stopped)`。
    pub fn run(mut self) -> Result<Completion> {
        info!("{} 🎬 Demuxer 线程启动: {}", log_ctx(), self.url);

        let mut reader = None;
        let result = self.run_session(&mut reader);

        self.rendezvous.end(&self.session, reader.take());

        match result {
            Ok(completion) => {
                self.set_phase(Phase::Terminated);
                info!("{} 🛑 Demuxer 线程退出: {:?}", log_ctx(), completion);
                Ok(completion)
            }
            Err(DemuxError::Cancelled) => {
                self.set_phase(Phase::Terminated);
                info!("{} ⏹ Demuxer 线程已停止", log_ctx());
                Ok(Completion::Stopped)
            }
            Err(e) => {
                self.set_phase(Phase::Error);
                error!("{} ❌ Demuxer 线程异常结束: {}", log_ctx(), e);
                Err(e)
            }
        }
    }

    fn run_session(&mut self, slot: &mut Option<Box<dyn StreamReader>>) -> Result<Completion> {
        let reader = slot.insert(self.open()?);
        self.discover_streams(&mut **reader)?;
        let outcome = self.playback_loop(&mut **reader);
        self.close(&**reader);
        outcome
    }

    // ==================== OPENING ====================

    fn open(&mut self) -> Result<Box<dyn StreamReader>> {
        self.set_phase(Phase::Opening);
        self.emit(SessionEvent::Status(PlaybackStatus::Opening));
        self.emit(SessionEvent::SetCurrentPlaying);

        let resolved = reader_factory::resolve_url(self.resolver.as_deref(), &self.url, &self.session.gate)?;
        self.url = resolved.url;
        self.name = resolved.name;

        match reader_factory::open_reader(self.factory.as_ref(), &self.url, &self.session.gate) {
            Ok(reader) => Ok(reader),
            Err(DemuxError::OpenFailed { url }) => {
                error!("{} ❌ 无法打开: {}", log_ctx(), url);
                self.emit(SessionEvent::OpenFailed { url: url.clone() });
                Err(DemuxError::OpenFailed { url })
            }
            Err(e) => Err(e),
        }
    }

    // ==================== STREAM_DISCOVERY ====================

    fn discover_streams(&mut self, reader: &mut dyn StreamReader) -> Result<()> {
        self.set_phase(Phase::StreamDiscovery);

        let streams = reader.streams_info();
        // 只有存在视频流时才找外部字幕
        if streams.iter().any(|s| s.kind == StreamKind::Video) {
            let found = ExternalSubtitleFinder::find_subtitle_files(&self.url, &self.config.subtitle_extensions);
            if !found.is_empty() {
                let all = self.session.add_file_subs(&found);
                self.emit(SessionEvent::SubtitleFilesFound(all));
            }
        }

        let loaded = self.load(reader);
        self.session.gate.check()?;
        if !loaded {
            error!("{} ❌ 没有可用的音频或视频流: {}", log_ctx(), self.url);
            return Err(DemuxError::NoUsableStreams);
        }

        self.update_frame_delay(reader);
        let gain = replay_gain::for_reader(reader, &self.config.replay_gain);
        self.session.set_replay_gain(gain);
        if gain != 1.0 {
            info!("{} 🔊 ReplayGain: {:.3}", log_ctx(), gain);
        }

        let length = reader.length();
        if length.is_none() {
            // 未知时长：不等待缓冲，也不上报缓冲秒数
            self.play_if_buffered = 0.0;
            self.update_buffered_seconds = false;
        }

        self.emit(SessionEvent::LengthChanged(length.unwrap_or(0.0)));
        self.emit(SessionEvent::Status(PlaybackStatus::Playing));
        self.emit(SessionEvent::PlayStateChanged(true));
        self.update_metadata(reader);
        Ok(())
    }

    /// 在所属上下文上重新绑定流；至少绑定了音频或视频才算成功
    fn load(&self, reader: &dyn StreamReader) -> bool {
        let streams = reader.streams_info();
        let binder = self.binder.clone();
        let session = self.session.clone();
        let bound = self
            .owner
            .call(move || binder.bind(&streams, &session))
            .unwrap_or(false);
        let selection = self.session.selection();
        info!(
            "{} 📎 流绑定: audio={:?} video={:?} subtitle={:?}",
            log_ctx(),
            selection.audio,
            selection.video,
            selection.subtitle
        );
        bound && selection.has_av()
    }

    fn must_reload_streams(&self, reader: &dyn StreamReader) -> bool {
        if !self.session.mark_reload() {
            return false;
        }
        if self.session.frame_last_delay() <= 0.0 {
            self.update_frame_delay(reader);
        }
        true
    }

    fn update_frame_delay(&self, reader: &dyn StreamReader) {
        let Some(video) = self.session.selection().video else {
            return;
        };
        if let Some(fps) = reader.streams_info().get(video).map(|s| s.fps).filter(|fps| *fps > 0.0) {
            self.session.set_frame_last_delay(1.0 / fps);
        }
    }

    fn update_metadata(&mut self, reader: &dyn StreamReader) {
        self.metadata = TrackMetadata::from_tags(&reader.tags());
        if self.metadata.title.is_empty() {
            if let Some(name) = &self.name {
                self.metadata.title = name.clone();
            }
        }
        let has_cover = reader.cover_image(false).map_or(false, |cover| !cover.is_empty());
        debug!("{} 🏷 元数据: {:?}", log_ctx(), self.metadata);
        self.emit(SessionEvent::Playing {
            playing: true,
            metadata: self.metadata.clone(),
            length: reader.length().unwrap_or(0.0),
            needs_cover: !has_cover && !self.metadata.is_empty(),
        });
    }

    // ==================== FILLING / STEADY ====================

    fn playback_loop(&mut self, reader: &mut dyn StreamReader) -> Result<Completion> {
        let local = reader.local_stream();
        let min_buffer = self.config.min_buffer_packets(local, reader.dont_use_buffer());
        let wait_for_data_interval = if self.play_if_buffered > 0.0 {
            self.config.wait_for_data_interval()
        } else {
            0.0
        };
        info!(
            "{} ▶ 开始读取：{}源，最小缓冲 {} 包，缓冲 {:.2}s 后播放",
            log_ctx(),
            if local { "本地" } else { "网络" },
            min_buffer,
            self.play_if_buffered
        );

        let mut state = LoopState {
            paused: false,
            reader_paused: false,
            last_report: Instant::now(),
            force_report: false,
            buffered: 0,
            last_buffered: 0,
            buffered_time: 0.0,
        };
        self.set_phase(Phase::Filling);

        loop {
            self.session.gate.check()?;
            let consumers = self.session.consumers();

            // 1. Seek
            if self.session.seek_request().is_pending() {
                self.handle_seek(reader, &consumers, local, &mut state)?;
            }

            // 2. 下游输出不可写视为致命
            self.session.gate.check()?;
            if !consumers.sinks_ready() {
                error!("{} ❌ 下游输出拒绝写入，结束会话", log_ctx());
                return Err(DemuxError::SinkRejected);
            }

            // 3. 暂停 / 恢复（只在状态变化时通知）
            self.detect_pause_edge(&mut state);

            // 4. 缓冲统计；网络源按时间间隔更新总量
            let wait_for_data = self.session.wait_for_data();
            let interval = if wait_for_data {
                wait_for_data_interval
            } else {
                self.config.buffered_report_interval_secs
            };
            let update_buffered =
                !local && (state.force_report || state.last_report.elapsed().as_secs_f64() >= interval);
            let snapshot = self.snapshot(&mut state, update_buffered || wait_for_data);

            // 5. 读取结束且缓冲排空、消费者空闲 → 结束
            if self.session.end_of_stream()
                && snapshot.video == 0
                && snapshot.audio == 0
                && buffer_policy::can_break(&consumers)
            {
                info!("{} 📄 缓冲已排空，播放结束", log_ctx());
                return Ok(Completion::EndOfStream);
            }

            if update_buffered {
                if state.last_buffered != state.buffered {
                    if self.update_buffered_seconds {
                        self.emit(SessionEvent::BufferedSeconds(state.buffered_time.round()));
                    }
                    state.last_buffered = state.buffered;
                    self.emit(SessionEvent::Buffered {
                        bytes: state.buffered,
                        seconds: state.buffered_time,
                    });
                    if reader.metadata_changed() {
                        self.update_metadata(reader);
                    }
                }
                state.last_report = Instant::now();
                state.force_report = false;
            } else if local && reader.metadata_changed() {
                self.update_metadata(reader);
            }

            // 6. 等待数据 ⇄ 恢复
            let active = ActiveStreams::from_consumers(&consumers);
            self.update_wait_for_data(active, &snapshot, min_buffer, local, &state);

            // 7. 缓冲区满：暂停读取，等待消费者请求更多数据
            if self.session.end_of_stream()
                || buffer_policy::buffered_packets(active, snapshot.video, snapshot.audio, min_buffer)
            {
                if state.paused && !state.reader_paused {
                    state.reader_paused = true;
                    reader.pause();
                }
                if !self.session.end_of_stream() && !state.paused {
                    self.set_phase(Phase::Steady);
                }
                self.wait_for_buffer_space(reader, state.paused)?;
                continue;
            }

            // 8. 读取一个数据包
            match reader.read() {
                Some(read) => {
                    thread::yield_now();
                    // 9. 每次成功读取后检查流选择是否变化
                    if self.must_reload_streams(reader) && !self.load(reader) {
                        error!("{} ❌ 重新加载流失败", log_ctx());
                        return Err(DemuxError::ReloadFailed);
                    }
                    self.route_packet(read, state.paused);
                }
                None => {
                    // 被中止的读取直接退出，不当作 EOF
                    self.session.gate.check()?;
                    let snapshot = self.snapshot(&mut state, false);
                    if snapshot.video > 0 || snapshot.audio > 0 || !buffer_policy::can_break(&consumers) {
                        if !self.session.end_of_stream() {
                            info!("{} 📄 读取结束，等待缓冲排空", log_ctx());
                        }
                        self.session.set_end_of_stream(true);
                        self.set_phase(Phase::EndOfStream);
                        if !local {
                            state.force_report = true;
                        }
                    } else {
                        info!("{} 📄 读取结束", log_ctx());
                        return Ok(Completion::EndOfStream);
                    }
                }
            }
        }
    }

    fn handle_seek(
        &mut self,
        reader: &mut dyn StreamReader,
        consumers: &Consumers,
        local: bool,
        state: &mut LoopState,
    ) -> Result<()> {
        let Some(resolved) = self.session.resolve_seek() else {
            return Ok(());
        };
        let target = resolved.target;
        self.set_phase(Phase::Seeking);
        self.emit(SessionEvent::Status(PlaybackStatus::Seeking));
        self.emit(SessionEvent::BufferedSeconds(0.0));
        self.session.set_can_update_pos(false);

        let position = self.session.position();
        let backwards = target < position;
        let mut must_seek = true;
        let mut flush = false;

        // 网络源向前 Seek：目标在已缓冲范围内时只裁剪队列
        if !backwards && !local && !resolved.no_seek_in_buffer {
            // 这里只持有队列锁，消费者锁在下面 flush 时才获取：
            // 两者之间消费者仍可能取走一个目标之后的数据包，但不会取到目标之前的旧包
            let mut queues = self.session.queues.lock_all();
            if queues.clip_all_to(target) {
                flush = true;
                must_seek = false;
                state.buffered_time = if queues.video.duration() > 0.0 {
                    queues.video.duration()
                } else {
                    queues.audio.duration()
                };
                self.emit(SessionEvent::BufferedSeconds(state.buffered_time));
                info!("{} ⏩ 在缓冲内 Seek 到 {:.2}s", log_ctx(), target);
            }
        }

        if must_seek {
            info!(
                "{} ⏩ StreamReader Seek 到 {:.2}s（{}）",
                log_ctx(),
                target,
                if backwards { "向后" } else { "向前" }
            );
            if reader.seek(target, backwards) {
                flush = true;
            } else {
                warn!("{} ⚠ Seek 到 {:.2}s 失败", log_ctx(), target);
            }
            self.session.gate.check()?;
        }

        if flush {
            self.session.set_end_of_stream(false);
            // 先锁消费者再锁队列，与消费者线程的加锁顺序一致
            let audio_lock = consumers.audio.as_deref().and_then(|c| ConsumerLock::acquire(c));
            let video_lock = consumers.video.as_deref().and_then(|c| ConsumerLock::acquire(c));
            {
                let mut queues = self.session.queues.lock_all();
                if must_seek {
                    queues.clear_all();
                }
                self.session.reset_audio_accumulators();
            }
            if !must_seek {
                self.emit(SessionEvent::FlushSubtitleEvents);
            }
            for consumer in consumers.iter() {
                consumer.flush_pending();
            }
            drop(audio_lock);
            drop(video_lock);
        }

        self.session.set_can_update_pos(true);
        if !self.session.finish_seek(&resolved) {
            info!("{} ⏩ Seek 期间收到新的请求，下一轮处理", log_ctx());
        }
        if !self.session.is_paused() {
            self.emit(SessionEvent::Status(PlaybackStatus::Playing));
        } else {
            // Seek 结束后恢复播放
            self.session.clear_paused();
        }
        self.set_phase(if must_seek { Phase::Filling } else { Phase::Steady });
        Ok(())
    }

    fn detect_pause_edge(&mut self, state: &mut LoopState) {
        if self.session.is_paused() {
            if !state.paused {
                state.paused = true;
                self.set_phase(Phase::Paused);
                self.emit(SessionEvent::Status(PlaybackStatus::Paused));
                self.emit(SessionEvent::PlayStateChanged(false));
                self.session.wake_consumers();
            }
        } else if state.paused {
            state.paused = false;
            state.reader_paused = false;
            self.set_phase(Phase::Steady);
            self.emit(SessionEvent::Status(PlaybackStatus::Playing));
            self.emit(SessionEvent::PlayStateChanged(true));
            self.session.wake_consumers();
        }
    }

    /// 三路队列加锁取快照；`totals` 为 true 时同时更新字节数和时长
    fn snapshot(&self, state: &mut LoopState, totals: bool) -> Snapshot {
        let queues = self.session.queues.lock_all();
        let snapshot = Snapshot {
            video: queues.video.count(),
            audio: queues.audio.count(),
        };
        if totals {
            state.buffered = queues.video.byte_size() + queues.audio.byte_size();
            state.buffered_time =
                buffer_policy::buffered_time(snapshot.video, queues.video.duration(), queues.audio.duration());
        }
        snapshot
    }

    fn update_wait_for_data(
        &mut self,
        active: ActiveStreams,
        snapshot: &Snapshot,
        min_buffer: usize,
        local: bool,
        state: &LoopState,
    ) {
        let wait_for_data = self.session.wait_for_data();
        let end_of_stream = self.session.end_of_stream();

        if !local
            && !wait_for_data
            && !end_of_stream
            && self.play_if_buffered > 0.0
            && buffer_policy::empty_buffers(active, snapshot.video, snapshot.audio)
        {
            info!("{} ⏳ 缓冲不足，等待数据", log_ctx());
            self.session.set_wait_for_data(true);
            self.set_phase(Phase::Filling);
            self.emit(SessionEvent::Status(PlaybackStatus::Buffering));
        } else if wait_for_data
            && (end_of_stream
                || buffer_policy::buffered_packets(active, snapshot.video, snapshot.audio, min_buffer)
                || state.buffered_time >= self.play_if_buffered
                || (state.buffered_time == 0.0
                    && buffer_policy::buffered_packets(active, snapshot.video, snapshot.audio, 1)))
        {
            info!("{} ✅ 缓冲完成（{:.2}s）", log_ctx(), state.buffered_time);
            self.session.set_wait_for_data(false);
            if !state.paused {
                self.session.wake_consumers();
                self.set_phase(Phase::Steady);
                self.emit(SessionEvent::Status(PlaybackStatus::Playing));
            }
        }
    }

    /// 缓冲区满时的背压等待
    ///
    /// 按轮询间隔醒来检查停止、流切换、Seek 和暂停变化，保证控制请求不会被饿死。
    fn wait_for_buffer_space(&self, reader: &dyn StreamReader, paused: bool) -> Result<()> {
        let poll = self.config.backpressure_poll();
        debug!("{} 🧱 缓冲区已满，等待消费者", log_ctx());
        loop {
            if self.session.wait_more_data(poll) {
                return Ok(());
            }
            self.session.gate.check()?;
            if self.must_reload_streams(reader) && !self.load(reader) {
                error!("{} ❌ 重新加载流失败", log_ctx());
                return Err(DemuxError::ReloadFailed);
            }
            if self.session.seek_request().is_pending()
                || self.session.is_paused() != paused
                || self.session.end_of_stream()
            {
                return Ok(());
            }
        }
    }

    fn route_packet(&self, read: ReadPacket, paused: bool) {
        let Some(index) = read.stream else {
            return;
        };
        // 切换流之后的重新 Seek 还没处理，丢弃旧流位置的数据
        if self.session.seek_request() == SeekRequest::CurrentPosition {
            return;
        }
        let selection = self.session.selection();
        let queue = if Some(index) == selection.audio {
            &self.session.queues.audio
        } else if Some(index) == selection.video {
            &self.session.queues.video
        } else if Some(index) == selection.subtitle {
            &self.session.queues.subtitle
        } else {
            return;
        };
        queue.enqueue(read.packet);
        if !paused && !self.session.wait_for_data() {
            self.session.wake_consumers();
        }
    }

    // ==================== CLOSING ====================

    fn close(&mut self, reader: &dyn StreamReader) {
        self.set_phase(Phase::Closing);
        self.emit(SessionEvent::Playing {
            playing: false,
            metadata: self.metadata.clone(),
            length: reader.length().unwrap_or(0.0),
            needs_cover: false,
        });
        self.session.set_end_of_stream(false);
        self.session.set_can_update_pos(false);
        self.session.set_wait_for_data(false);
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("{} 🔀 {} → {}", log_ctx(), self.phase.as_str(), phase.as_str());
            self.phase = phase;
            self.emit(SessionEvent::PhaseChanged(phase));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // 接收端已关闭时忽略
        let _ = self.events.send(event);
    }
}
