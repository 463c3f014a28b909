/// 音频 / 视频解码渲染线程的句柄
///
/// 解码和渲染不在本 crate 内实现，协调器只通过这个接口观察消费者。
pub trait ConsumerHandle: Send + Sync {
    /// 获取消费者的互斥锁，保证清空队列时它不在读取数据包中途；拿到锁返回 true
    fn lock(&self) -> bool;

    fn unlock(&self);

    /// 消费者当前处于饥饿 / 空闲状态（没有待处理的工作）
    fn is_idle(&self) -> bool;

    /// 下游输出是否还能接受写入；没有输出时视为可写
    fn sink_ready(&self) -> bool {
        true
    }

    /// 丢弃正在处理的帧（Seek 后调用）
    fn flush_pending(&self);

    /// 停止并释放解码状态
    fn stop(&self);

    fn name(&self) -> String {
        String::from("consumer")
    }
}

/// 消费者锁的 RAII 封装，drop 时自动解锁
pub struct ConsumerLock<'a> {
    consumer: &'a dyn ConsumerHandle,
}

impl<'a> ConsumerLock<'a> {
    /// 尝试加锁；消费者拒绝时返回 None
    pub fn acquire(consumer: &'a dyn ConsumerHandle) -> Option<Self> {
        if consumer.lock() {
            Some(Self { consumer })
        } else {
            None
        }
    }
}

impl Drop for ConsumerLock<'_> {
    fn drop(&mut self) {
        self.consumer.unlock();
    }
}
