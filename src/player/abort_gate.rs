//! 共享的中止标记 + 锁
//!
//! 锁保护当前活动的 URL 解析器和 StreamReader 的中止句柄。stop() 先置位标记，
//! 再在锁内中止当前活动的操作；登记句柄时也在锁内检查标记，所以不会漏掉中止。

use crate::core::{DemuxError, Result};
use crate::player::stream_reader::AbortHandle;
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct ActiveOps {
    resolver: Option<Arc<dyn AbortHandle>>,
    reader: Option<Arc<dyn AbortHandle>>,
}

#[derive(Default)]
pub struct AbortGate {
    aborted: AtomicBool,
    active: Mutex<ActiveOps>,
}

/// 解析器登记期间的守卫，drop 时注销
pub struct ResolverGuard<'a> {
    gate: &'a AbortGate,
}

impl Drop for ResolverGuard<'_> {
    fn drop(&mut self) {
        self.gate.active.lock().resolver = None;
    }
}

impl AbortGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 幂等、线程安全
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let active = self.active.lock();
        if let Some(resolver) = &active.resolver {
            debug!("⏹ 中止 URL 解析");
            resolver.abort();
        }
        if let Some(reader) = &active.reader {
            debug!("⏹ 中止 StreamReader");
            reader.abort();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// 阻塞调用返回后立即检查
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(DemuxError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 登记正在阻塞的解析器；已中止时立即中止它
    pub fn arm_resolver(&self, handle: Arc<dyn AbortHandle>) -> ResolverGuard<'_> {
        let mut active = self.active.lock();
        if self.is_aborted() {
            handle.abort();
        }
        active.resolver = Some(handle);
        ResolverGuard { gate: self }
    }

    /// 登记 StreamReader；已中止时立即中止它
    pub fn attach_reader(&self, handle: Arc<dyn AbortHandle>) {
        let mut active = self.active.lock();
        if self.is_aborted() {
            handle.abort();
        }
        active.reader = Some(handle);
    }

    /// 销毁 StreamReader 之前注销，之后的 abort() 不再触碰它
    pub fn detach_reader(&self) {
        self.active.lock().reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingAbort(AtomicUsize);

    impl AbortHandle for CountingAbort {
        fn abort(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_abort_reaches_active_reader_and_resolver() {
        let gate = AbortGate::new();
        let reader = Arc::new(CountingAbort::default());
        let resolver = Arc::new(CountingAbort::default());
        gate.attach_reader(reader.clone());
        let _guard = gate.arm_resolver(resolver.clone());
        assert!(gate.check().is_ok());

        gate.abort();
        assert_eq!(reader.0.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.0.load(Ordering::SeqCst), 1);
        assert!(gate.check().unwrap_err().is_cancellation());
    }

    #[test]
    fn test_late_registration_is_aborted_immediately() {
        let gate = AbortGate::new();
        gate.abort();
        let reader = Arc::new(CountingAbort::default());
        gate.attach_reader(reader.clone());
        assert_eq!(reader.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_handles_are_not_touched() {
        let gate = AbortGate::new();
        let reader = Arc::new(CountingAbort::default());
        let resolver = Arc::new(CountingAbort::default());
        gate.attach_reader(reader.clone());
        drop(gate.arm_resolver(resolver.clone()));
        gate.detach_reader();
        gate.abort();
        gate.abort();
        assert_eq!(reader.0.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.0.load(Ordering::SeqCst), 0);
        assert!(gate.is_aborted());
    }
}
