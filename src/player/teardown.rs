//! 所属上下文与跨线程销毁握手
//!
//! 某些资源（例如硬件解码上下文）只能在创建它们的上下文上释放。其它线程通过
//! [`OwnerHandle`] 向所属上下文的任务队列投递请求，并阻塞等待应答。
//! 所属上下文必须定期调用 [`OwnerContext::process_pending`]。

use crate::player::session::PlaybackSession;
use crate::player::stream_reader::StreamReader;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

type Task = Box<dyn FnOnce() + Send>;

/// 所属上下文（在创建它的线程上处理任务）
pub struct OwnerContext {
    handle: OwnerHandle,
    task_rx: Receiver<Task>,
}

/// 指向所属上下文的句柄，可在任意线程使用
#[derive(Clone)]
pub struct OwnerHandle {
    thread: ThreadId,
    task_tx: Sender<Task>,
}

impl OwnerContext {
    /// 以当前线程作为所属上下文
    pub fn new() -> Self {
        let (task_tx, task_rx) = unbounded();
        Self {
            handle: OwnerHandle {
                thread: thread::current().id(),
                task_tx,
            },
            task_rx,
        }
    }

    pub fn handle(&self) -> OwnerHandle {
        self.handle.clone()
    }

    /// 执行所有待处理任务，返回执行的数量
    pub fn process_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.task_rx.try_recv() {
            task();
            count += 1;
        }
        count
    }

    /// 最多等待 `timeout` 执行一个任务
    pub fn process_one(&self, timeout: Duration) -> bool {
        match self.task_rx.recv_timeout(timeout) {
            Ok(task) => {
                task();
                true
            }
            Err(_) => false,
        }
    }

    /// 持续处理任务直到 `done()` 为真或超时；返回 `done()` 的最终结果
    pub fn process_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return done();
            }
            self.process_one((deadline - now).min(Duration::from_millis(10)));
        }
        true
    }
}

impl Default for OwnerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerHandle {
    /// 当前线程是否就是所属上下文
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// 投递任务；所属上下文已销毁时返回 false
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.task_tx.send(Box::new(task)).is_ok()
    }

    /// 在所属上下文上同步执行 `f` 并返回结果
    ///
    /// 在所属上下文上调用时直接执行；所属上下文已销毁或丢弃任务时返回 None。
    pub fn call<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Some(f());
        }
        let (reply_tx, reply_rx) = bounded(1);
        if !self.post(move || {
            let _ = reply_tx.send(f());
        }) {
            return None;
        }
        reply_rx.recv().ok()
    }
}

/// 释放会话绑定的资源：清空队列，停止消费者。总在所属上下文上执行。
fn release_session(session: &PlaybackSession) {
    session.queues.clear_all();
    let consumers = session.take_consumers();
    for consumer in consumers.iter() {
        debug!("{} ⏹ 停止消费者: {}", log_ctx(), consumer.name());
        consumer.stop();
    }
    session.wake_consumers();
}

/// 跨线程销毁握手
///
/// 保证 StreamReader 只在所属上下文释放完会话资源之后销毁，且每个会话只销毁一次。
pub struct TeardownRendezvous {
    owner: OwnerHandle,
    teardown_lock: Mutex<()>,
    ended: AtomicBool,
}

impl TeardownRendezvous {
    pub fn new(owner: OwnerHandle) -> Self {
        Self {
            owner,
            teardown_lock: Mutex::new(()),
            ended: AtomicBool::new(false),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// 释放会话资源并销毁 StreamReader；重复调用无效
    pub fn end(&self, session: &Arc<PlaybackSession>, reader: Option<Box<dyn StreamReader>>) {
        let _teardown = self.teardown_lock.lock();
        if self.ended.swap(true, Ordering::SeqCst) {
            warn!("{} ⚠ 会话已经销毁过，忽略重复的 end()", log_ctx());
            return;
        }

        if self.owner.is_current() {
            info!("{} 🧹 在所属上下文上直接释放会话资源", log_ctx());
            release_session(session);
            Self::destroy_reader(session, reader);
            return;
        }

        // 所属上下文释放完后一直等到 StreamReader 销毁（destroyed_tx 被 drop）才返回
        let (released_tx, released_rx) = bounded::<()>(1);
        let (destroyed_tx, destroyed_rx) = bounded::<()>(0);
        let task_session = session.clone();
        let posted = self.owner.post(move || {
            release_session(&task_session);
            let _ = released_tx.send(());
            let _ = destroyed_rx.recv();
        });

        if posted && released_rx.recv().is_ok() {
            info!("{} 🧹 所属上下文已释放会话资源", log_ctx());
        } else {
            warn!("{} ⚠ 所属上下文不可用，在当前线程释放会话资源", log_ctx());
            release_session(session);
        }

        Self::destroy_reader(session, reader);
        drop(destroyed_tx);
    }

    fn destroy_reader(session: &PlaybackSession, reader: Option<Box<dyn StreamReader>>) {
        session.gate.detach_reader();
        if let Some(reader) = reader {
            info!("{} 🗑 销毁 StreamReader: {}", log_ctx(), reader.description());
            drop(reader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Packet, Result, StreamInfo};
    use crate::player::consumer::ConsumerHandle;
    use crate::player::session::Consumers;
    use crate::player::stream_reader::{AbortHandle, ReadPacket};
    use parking_lot::Mutex as PlMutex;

    /// 记录事件顺序
    type Journal = Arc<PlMutex<Vec<String>>>;

    struct NoAbort;

    impl AbortHandle for NoAbort {
        fn abort(&self) {}
    }

    struct JournalReader {
        journal: Journal,
    }

    impl StreamReader for JournalReader {
        fn open(&mut self, _url: &str) -> Result<()> {
            Ok(())
        }
        fn read(&mut self) -> Option<ReadPacket> {
            None
        }
        fn seek(&mut self, _target: f64, _backwards: bool) -> bool {
            false
        }
        fn abort_handle(&self) -> Arc<dyn AbortHandle> {
            Arc::new(NoAbort)
        }
        fn length(&self) -> Option<f64> {
            None
        }
        fn streams_info(&self) -> Vec<StreamInfo> {
            Vec::new()
        }
        fn local_stream(&self) -> bool {
            true
        }
        fn name(&self) -> String {
            "journal".to_string()
        }
    }

    impl Drop for JournalReader {
        fn drop(&mut self) {
            self.journal.lock().push("reader dropped".to_string());
        }
    }

    struct JournalConsumer {
        journal: Journal,
        owner_thread: ThreadId,
    }

    impl ConsumerHandle for JournalConsumer {
        fn lock(&self) -> bool {
            true
        }
        fn unlock(&self) {}
        fn is_idle(&self) -> bool {
            true
        }
        fn flush_pending(&self) {}
        fn stop(&self) {
            let on_owner = thread::current().id() == self.owner_thread;
            self.journal.lock().push(format!("consumer stopped on owner: {}", on_owner));
        }
    }

    fn session_with_consumer(journal: &Journal) -> Arc<PlaybackSession> {
        let session = PlaybackSession::new();
        session.queues.audio.enqueue(Packet::new(vec![1u8], 0.0, 1.0));
        session.bind_streams(
            Some(0),
            None,
            None,
            Consumers {
                audio: Some(Arc::new(JournalConsumer {
                    journal: journal.clone(),
                    owner_thread: thread::current().id(),
                })),
                video: None,
            },
        );
        session
    }

    #[test]
    fn test_end_on_owner_context_runs_inline() {
        let journal: Journal = Arc::default();
        let owner = OwnerContext::new();
        let session = session_with_consumer(&journal);
        let rendezvous = TeardownRendezvous::new(owner.handle());

        rendezvous.end(&session, Some(Box::new(JournalReader { journal: journal.clone() })));
        assert_eq!(
            *journal.lock(),
            vec!["consumer stopped on owner: true".to_string(), "reader dropped".to_string()]
        );
        assert_eq!(session.queues.audio.count(), 0);
        assert!(session.consumers().audio.is_none());
    }

    #[test]
    fn test_end_from_other_thread_releases_on_owner_first() {
        let journal: Journal = Arc::default();
        let owner = OwnerContext::new();
        let session = session_with_consumer(&journal);
        let rendezvous = Arc::new(TeardownRendezvous::new(owner.handle()));

        let worker = {
            let (rendezvous, session, journal) = (rendezvous.clone(), session.clone(), journal.clone());
            thread::spawn(move || {
                rendezvous.end(&session, Some(Box::new(JournalReader { journal })));
            })
        };
        assert!(owner.process_until(Duration::from_secs(5), || worker.is_finished()));
        worker.join().unwrap();

        assert_eq!(
            *journal.lock(),
            vec!["consumer stopped on owner: true".to_string(), "reader dropped".to_string()]
        );
    }

    #[test]
    fn test_end_is_only_performed_once() {
        let journal: Journal = Arc::default();
        let owner = OwnerContext::new();
        let session = session_with_consumer(&journal);
        let rendezvous = TeardownRendezvous::new(owner.handle());

        rendezvous.end(&session, Some(Box::new(JournalReader { journal: journal.clone() })));
        rendezvous.end(&session, Some(Box::new(JournalReader { journal: journal.clone() })));
        // 第二个 reader 只是在被忽略时随参数 drop
        let entries = journal.lock().clone();
        assert_eq!(entries.iter().filter(|e| e.starts_with("consumer")).count(), 1);
        assert!(rendezvous.is_ended());
    }

    #[test]
    fn test_end_without_owner_falls_back_to_current_thread() {
        let journal: Journal = Arc::default();
        let handle = OwnerContext::new().handle();
        let session = session_with_consumer(&journal);
        let rendezvous = Arc::new(TeardownRendezvous::new(handle));

        let journal_for_worker = journal.clone();
        thread::spawn(move || {
            rendezvous.end(&session, Some(Box::new(JournalReader { journal: journal_for_worker })));
        })
        .join()
        .unwrap();

        let entries = journal.lock().clone();
        assert_eq!(entries.last().map(String::as_str), Some("reader dropped"));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_call_runs_on_owner_thread() {
        let owner = OwnerContext::new();
        let handle = owner.handle();
        let owner_thread = thread::current().id();
        let worker = thread::spawn(move || handle.call(move || thread::current().id() == owner_thread));
        assert!(owner.process_until(Duration::from_secs(5), || worker.is_finished()));
        assert_eq!(worker.join().unwrap(), Some(true));
    }

    #[test]
    fn test_call_inline_and_after_owner_dropped() {
        let owner = OwnerContext::new();
        let handle = owner.handle();
        assert_eq!(handle.call(|| 7), Some(7));
        drop(owner);
        let result = thread::spawn(move || handle.call(|| 7)).join().unwrap();
        assert_eq!(result, None);
    }
}
