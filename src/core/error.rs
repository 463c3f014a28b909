use thiserror::Error;

#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("无法打开: {url}")]
    OpenFailed { url: String },

    #[error("没有可用的音频或视频流")]
    NoUsableStreams,

    #[error("重新加载流绑定失败")]
    ReloadFailed,

    #[error("下游输出拒绝写入")]
    SinkRejected,

    #[error("操作已取消")]
    Cancelled,

    #[error("Demuxer 线程异常退出")]
    ThreadPanicked,

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl DemuxError {
    /// 通过 AbortGate 中止的操作不算错误
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DemuxError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, DemuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_failure_names_resource() {
        let err = DemuxError::OpenFailed {
            url: "/media/missing.mkv".to_string(),
        };
        assert!(err.to_string().contains("/media/missing.mkv"));
        assert!(!err.is_cancellation());
        assert!(DemuxError::Cancelled.is_cancellation());
    }
}
