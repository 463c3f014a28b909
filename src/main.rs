use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use demux_buffer::core::{CoordinatorConfig, SessionEvent, StreamInfo, StreamKind};
use demux_buffer::player::{
    ConsumerHandle, Consumers, DemuxCoordinator, DemuxerThread, MemoryReader, MemorySource,
    OwnerContext, PacketQueue, PlaybackSession, StreamBinder, StreamReader,
};
use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 演示时的播放倍速
const DEMO_SPEED: f64 = 20.0;

/// 消费者锁：持有期间消费者线程不会取数据包
#[derive(Default)]
struct PacketGate {
    held: Mutex<bool>,
    cond: Condvar,
}

impl PacketGate {
    fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.cond.wait(&mut held);
        }
        *held = true;
    }

    fn release(&self) {
        *self.held.lock() = false;
        self.cond.notify_one();
    }
}

/// 只取出数据包、按时长休眠的模拟解码线程
struct DemoConsumer {
    name: String,
    gate: Arc<PacketGate>,
    idle: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DemoConsumer {
    fn spawn(name: &str, session: Arc<PlaybackSession>, audio: bool) -> Arc<Self> {
        let gate = Arc::new(PacketGate::default());
        let idle = Arc::new(AtomicBool::new(true));
        let stopped = Arc::new(AtomicBool::new(false));

        let thread = {
            let (gate, idle, stopped) = (gate.clone(), idle.clone(), stopped.clone());
            thread::spawn(move || {
                let queue: &PacketQueue = if audio { &session.queues.audio } else { &session.queues.video };
                while !stopped.load(Ordering::SeqCst) {
                    if session.is_paused() || session.wait_for_data() {
                        thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    gate.acquire();
                    let packet = queue.dequeue();
                    gate.release();
                    match packet {
                        Some(packet) => {
                            idle.store(false, Ordering::SeqCst);
                            if audio && session.can_update_pos() {
                                session.set_position(packet.ts);
                            }
                            session.request_more_data();
                            thread::sleep(Duration::from_secs_f64(packet.duration / DEMO_SPEED));
                        }
                        None => {
                            idle.store(true, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(2));
                        }
                    }
                }
            })
        };

        Arc::new(Self {
            name: name.to_string(),
            gate,
            idle,
            stopped,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl ConsumerHandle for DemoConsumer {
    fn lock(&self) -> bool {
        self.gate.acquire();
        true
    }

    fn unlock(&self) {
        self.gate.release();
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    fn flush_pending(&self) {
        info!("🧹 {} 丢弃待处理帧", self.name);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// 选第一个音频 / 视频流，消费者只创建一次
struct DemoBinder {
    session: Arc<PlaybackSession>,
    consumers: Mutex<Consumers>,
}

impl StreamBinder for DemoBinder {
    fn bind(&self, streams: &[StreamInfo], session: &PlaybackSession) -> bool {
        let selection = session.selection();
        let first = |kind: StreamKind| streams.iter().position(|s| s.kind == kind);
        let audio = selection.chosen_audio.or_else(|| first(StreamKind::Audio));
        let video = selection.chosen_video.or_else(|| first(StreamKind::Video));

        let mut consumers = self.consumers.lock();
        if audio.is_some() && consumers.audio.is_none() {
            consumers.audio = Some(DemoConsumer::spawn("audio", self.session.clone(), true));
        }
        if video.is_some() && consumers.video.is_none() {
            consumers.video = Some(DemoConsumer::spawn("video", self.session.clone(), false));
        }
        session.bind_streams(audio, video, selection.chosen_subtitle, consumers.clone());
        true
    }
}

fn load_config() -> Result<CoordinatorConfig> {
    let config = match std::env::args().nth(1) {
        Some(path) => CoordinatorConfig::from_json_file(&path)
            .with_context(|| format!("读取配置文件失败: {}", path))?,
        None => CoordinatorConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn demo_source() -> MemorySource {
    let mut source = MemorySource::interleaved(10.0, 25.0, 0.1);
    source.name = "demo".to_string();
    source.local = false;
    source.read_delay = Some(Duration::from_millis(1));
    source.tags = vec![
        ("title".to_string(), "Demo Clip".to_string()),
        ("artist".to_string(), "demux_buffer".to_string()),
    ];
    source
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 demux_buffer 演示启动");
    let config = load_config()?;

    let owner = OwnerContext::new();
    let session = PlaybackSession::new();
    let (events_tx, events_rx) = unbounded();

    let source = demo_source();
    let factory = move |_url: &str| -> Option<Box<dyn StreamReader>> {
        Some(Box::new(MemoryReader::new(source.clone())))
    };
    let binder = Arc::new(DemoBinder {
        session: session.clone(),
        consumers: Mutex::new(Consumers::default()),
    });

    let coordinator = DemuxCoordinator::new(
        "memory://demo",
        session.clone(),
        Arc::new(factory),
        binder,
        owner.handle(),
        events_tx,
    )
    .with_config(config);
    let mut demuxer = DemuxerThread::start(coordinator).context("无法创建 Demuxer 线程")?;

    let mut seeked = false;
    while !demuxer.is_finished() {
        owner.process_one(Duration::from_millis(10));
        for event in events_rx.try_iter() {
            report(&event);
        }
        if !seeked && session.position() >= 2.0 {
            seeked = true;
            demuxer.seek(6.0);
        }
    }

    let completion = demuxer.join(Some(&owner))?;
    for event in events_rx.try_iter() {
        report(&event);
    }
    let status = demuxer.buffer_status();
    info!("✅ 演示结束: {:?}（剩余 {} 个视频包，{} 个音频包）", completion, status.video_packets, status.audio_packets);
    Ok(())
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::Buffered { bytes, seconds } => {
            info!("📊 已缓冲 {} 字节 / {:.2}s", bytes, seconds);
        }
        SessionEvent::OpenFailed { url } => warn!("❌ 无法打开: {}", url),
        SessionEvent::Playing { playing: true, metadata, length, .. } => {
            info!("▶ 正在播放: {} - {}（{:.1}s）", metadata.artist, metadata.title, length);
        }
        other => info!("📣 {:?}", other),
    }
}
