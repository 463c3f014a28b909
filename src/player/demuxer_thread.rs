use crate::core::{BufferStatus, Completion, DemuxError, Result};
use crate::player::buffer_policy;
use crate::player::coordinator::DemuxCoordinator;
use crate::player::session::PlaybackSession;
use crate::player::teardown::OwnerContext;
use log::{error, info, warn};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// Demuxer 线程管理器
/// - 协调器在独立线程运行，控制请求通过共享的 PlaybackSession 传递
/// - join() 期间在调用线程上处理所属上下文的任务（流绑定、会话销毁）
pub struct DemuxerThread {
    thread_handle: Option<JoinHandle<Result<Completion>>>,
    session: Arc<PlaybackSession>,
}

impl DemuxerThread {
    /// 启动 Demuxer 线程
    pub fn start(coordinator: DemuxCoordinator) -> std::io::Result<Self> {
        let session = coordinator.session().clone();
        let thread_handle = thread::Builder::new()
            .name("demuxer".to_string())
            .spawn(move || coordinator.run())?;
        info!("{} 🚀 Demuxer 线程已创建", log_ctx());

        Ok(Self {
            thread_handle: Some(thread_handle),
            session,
        })
    }

    pub fn session(&self) -> &Arc<PlaybackSession> {
        &self.session
    }

    /// 请求 Seek（秒）
    pub fn seek(&self, seconds: f64) {
        info!("{} ⏩ 请求 Seek: {:.2}s", log_ctx(), seconds);
        self.session.request_seek(seconds);
    }

    pub fn pause(&self) {
        self.session.set_paused(true);
    }

    pub fn resume(&self) {
        self.session.set_paused(false);
    }

    /// 当前缓冲情况
    pub fn buffer_status(&self) -> BufferStatus {
        let queues = self.session.queues.lock_all();
        BufferStatus {
            video_packets: queues.video.count(),
            audio_packets: queues.audio.count(),
            bytes: queues.video.byte_size() + queues.audio.byte_size(),
            seconds: buffer_policy::buffered_time(
                queues.video.count(),
                queues.video.duration(),
                queues.audio.duration(),
            ),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread_handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// 请求停止（可在任意线程调用，不阻塞）
    pub fn stop(&self) {
        info!("{} 🛑 DemuxerThread::stop() called", log_ctx());
        self.session.stop();
    }

    /// 等待线程结束
    ///
    /// `owner` 是协调器所属的上下文时必须传入，否则流绑定和会话销毁会一直等待。
    pub fn join(&mut self, owner: Option<&OwnerContext>) -> Result<Completion> {
        let Some(handle) = self.thread_handle.take() else {
            return Ok(Completion::Stopped);
        };
        if let Some(owner) = owner {
            while !handle.is_finished() {
                owner.process_one(Duration::from_millis(10));
            }
            owner.process_pending();
        }
        match handle.join() {
            Ok(result) => result,
            Err(_) => {
                error!("{} ❌ Demuxer 线程 panic", log_ctx());
                Err(DemuxError::ThreadPanicked)
            }
        }
    }
}

impl Drop for DemuxerThread {
    fn drop(&mut self) {
        if self.thread_handle.take().is_some() {
            // 可能就在所属上下文上 drop，这里不 join，线程在所属上下文销毁后自行退出
            warn!("{} ⚠ DemuxerThread 被 drop，但未调用 join()，已请求停止", log_ctx());
            self.session.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SessionEvent, StreamInfo};
    use crate::player::memory_reader::{MemoryReader, MemorySource};
    use crate::player::session::{Consumers, StreamBinder};
    use crate::player::stream_reader::StreamReader;
    use crossbeam_channel::unbounded;

    struct AudioOnlyBinder;

    impl StreamBinder for AudioOnlyBinder {
        fn bind(&self, _streams: &[StreamInfo], session: &PlaybackSession) -> bool {
            session.bind_streams(Some(1), None, None, Consumers::default());
            true
        }
    }

    fn coordinator(owner: &OwnerContext, source: MemorySource) -> DemuxCoordinator {
        let factory = move |_url: &str| -> Option<Box<dyn StreamReader>> {
            Some(Box::new(MemoryReader::new(source.clone())))
        };
        let (events_tx, _events_rx) = unbounded::<SessionEvent>();
        DemuxCoordinator::new(
            "memory://clip",
            PlaybackSession::new(),
            Arc::new(factory),
            Arc::new(AudioOnlyBinder),
            owner.handle(),
            events_tx,
        )
    }

    #[test]
    fn test_stop_and_join_with_owner() {
        let owner = OwnerContext::new();
        let mut demuxer = DemuxerThread::start(coordinator(&owner, MemorySource::interleaved(30.0, 25.0, 0.1))).unwrap();

        while demuxer.buffer_status().audio_packets == 0 {
            owner.process_one(Duration::from_millis(10));
        }
        demuxer.pause();
        demuxer.stop();
        assert_eq!(demuxer.join(Some(&owner)).unwrap(), Completion::Stopped);
        assert!(demuxer.is_finished());
        // 第二次 join 直接返回
        assert_eq!(demuxer.join(Some(&owner)).unwrap(), Completion::Stopped);
    }

    #[test]
    fn test_drop_without_join_requests_stop() {
        let owner = OwnerContext::new();
        let demuxer = DemuxerThread::start(coordinator(&owner, MemorySource::interleaved(30.0, 25.0, 0.1))).unwrap();
        let session = demuxer.session().clone();
        drop(demuxer);
        assert!(session.is_stopped());
        // 线程结束前还需要所属上下文处理销毁请求
        assert!(owner.process_until(Duration::from_secs(5), || Arc::strong_count(&session) == 1));
    }
}
