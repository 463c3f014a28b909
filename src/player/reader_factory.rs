use crate::core::{DemuxError, Result};
use crate::player::abort_gate::AbortGate;
use crate::player::stream_reader::StreamReader;
use log::{error, info};

/// 插件前缀解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    /// 真正要打开的地址
    pub url: String,
    /// 解析器给出的显示名称
    pub name: Option<String>,
}

/// 带插件前缀的地址解析器（例如需要先请求网页才能拿到真实地址）
///
/// 解析可能长时间阻塞：实现者应在阻塞前通过 [`AbortGate::arm_resolver`] 登记中止句柄。
pub trait UrlResolver: Send + Sync {
    /// 不认识的地址返回 Ok(None)，保持原样
    fn resolve(&self, url: &str, gate: &AbortGate) -> Result<Option<ResolvedUrl>>;
}

/// StreamReader 工厂：根据地址选择实现（尚未打开）
pub trait ReaderFactory: Send + Sync {
    fn create(&self, url: &str) -> Option<Box<dyn StreamReader>>;
}

impl<F> ReaderFactory for F
where
    F: Fn(&str) -> Option<Box<dyn StreamReader>> + Send + Sync,
{
    fn create(&self, url: &str) -> Option<Box<dyn StreamReader>> {
        self(url)
    }
}

/// 用解析器处理地址；没有解析器或解析器不认识时原样返回
pub fn resolve_url(
    resolver: Option<&dyn UrlResolver>,
    url: &str,
    gate: &AbortGate,
) -> Result<ResolvedUrl> {
    let resolved = match resolver {
        Some(resolver) => resolver.resolve(url, gate)?,
        None => None,
    };
    gate.check()?;
    Ok(resolved.unwrap_or_else(|| ResolvedUrl {
        url: url.to_string(),
        name: None,
    }))
}

/// 创建并打开 StreamReader
///
/// 打开期间 reader 的中止句柄登记在 gate 上，stop() 可以让 open 提前返回。
/// 成功后句柄保持登记，直到会话销毁时注销。
pub fn open_reader(factory: &dyn ReaderFactory, url: &str, gate: &AbortGate) -> Result<Box<dyn StreamReader>> {
    gate.check()?;
    let Some(mut reader) = factory.create(url) else {
        error!("❌ 没有可以处理该地址的 StreamReader: {}", url);
        return Err(DemuxError::OpenFailed { url: display_url(url) });
    };

    gate.attach_reader(reader.abort_handle());
    let opened = reader.open(url);

    if gate.is_aborted() {
        gate.detach_reader();
        return Err(DemuxError::Cancelled);
    }
    match opened {
        Ok(()) => {
            info!("✅ StreamReader 已打开: {} ({})", url, reader.name());
            Ok(reader)
        }
        Err(e) => {
            gate.detach_reader();
            error!("❌ 无法打开 {}: {}", url, e);
            Err(DemuxError::OpenFailed { url: display_url(url) })
        }
    }
}

/// 诊断信息中使用的地址（去掉 file:// 前缀）
pub fn display_url(url: &str) -> String {
    url.replace("file://", "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::memory_reader::{MemoryReader, MemorySource};
    use crate::player::stream_reader::AbortHandle;
    use std::sync::Arc;

    struct PrefixResolver;

    impl UrlResolver for PrefixResolver {
        fn resolve(&self, url: &str, _gate: &AbortGate) -> Result<Option<ResolvedUrl>> {
            Ok(url.strip_prefix("demo://").map(|rest| ResolvedUrl {
                url: format!("file:///media/{}", rest),
                name: Some(rest.to_string()),
            }))
        }
    }

    struct CancellingResolver;

    struct Noop;

    impl AbortHandle for Noop {
        fn abort(&self) {}
    }

    impl UrlResolver for CancellingResolver {
        fn resolve(&self, url: &str, gate: &AbortGate) -> Result<Option<ResolvedUrl>> {
            let _armed = gate.arm_resolver(Arc::new(Noop));
            gate.abort();
            Ok(Some(ResolvedUrl { url: url.to_string(), name: None }))
        }
    }

    fn memory_factory(url: &str) -> Option<Box<dyn StreamReader>> {
        if url.ends_with(".missing") {
            return None;
        }
        let mut source = MemorySource::default();
        source.fail_open = url.ends_with(".broken");
        Some(Box::new(MemoryReader::new(source)))
    }

    #[test]
    fn test_resolver_rewrites_prefixed_urls() {
        let gate = AbortGate::new();
        let resolved = resolve_url(Some(&PrefixResolver), "demo://clip.mkv", &gate).unwrap();
        assert_eq!(resolved.url, "file:///media/clip.mkv");
        assert_eq!(resolved.name.as_deref(), Some("clip.mkv"));

        let plain = resolve_url(Some(&PrefixResolver), "file:///a.mkv", &gate).unwrap();
        assert_eq!(plain.url, "file:///a.mkv");
        assert_eq!(resolve_url(None, "x", &gate).unwrap().url, "x");
    }

    #[test]
    fn test_cancelled_resolution() {
        let gate = AbortGate::new();
        let err = resolve_url(Some(&CancellingResolver), "demo://x", &gate).unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_open_failures_name_the_resource() {
        let gate = AbortGate::new();
        match open_reader(&memory_factory, "file:///media/a.broken", &gate) {
            Err(DemuxError::OpenFailed { url }) => assert_eq!(url, "/media/a.broken"),
            other => panic!("unexpected: {:?}", other.map(|r| r.name())),
        }
        assert!(matches!(
            open_reader(&memory_factory, "file:///media/a.missing", &gate),
            Err(DemuxError::OpenFailed { .. })
        ));
        assert!(open_reader(&memory_factory, "file:///media/a.mkv", &gate).is_ok());
    }

    #[test]
    fn test_open_after_stop_is_cancelled() {
        let gate = AbortGate::new();
        gate.abort();
        assert!(matches!(
            open_reader(&memory_factory, "file:///media/a.mkv", &gate),
            Err(e) if e.is_cancellation()
        ));
    }
}
