use crate::core::{DemuxError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// ReplayGain 设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayGainConfig {
    /// 是否启用
    pub enabled: bool,
    /// 使用专辑增益（否则使用音轨增益）
    pub album: bool,
    /// 前置放大（dB）
    pub preamp_db: f64,
    /// 防止削波：peak * gain > 1.0 时把增益限制为 1 / peak
    pub prevent_clipping: bool,
}

impl Default for ReplayGainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            album: false,
            preamp_db: 0.0,
            prevent_clipping: true,
        }
    }
}

/// 缓冲协调器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// 本地源的最小缓冲包数
    pub min_buffer_packets_local: usize,
    /// 网络源的最小缓冲包数
    pub min_buffer_packets_network: usize,
    /// 网络源缓冲够多少秒后才开始播放（0 表示不等待）
    pub play_if_buffered_secs: f64,
    /// 是否上报已缓冲秒数
    pub update_buffered_seconds: bool,
    /// 缓冲区满时的轮询间隔（毫秒）
    pub backpressure_poll_ms: u64,
    /// 网络源缓冲统计的上报间隔（秒）
    pub buffered_report_interval_secs: f64,
    /// 等待数据期间缓冲统计间隔的上限（秒）
    pub wait_for_data_report_cap_secs: f64,
    /// 外部字幕扩展名（不含点）
    pub subtitle_extensions: Vec<String>,
    pub replay_gain: ReplayGainConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_buffer_packets_local: 100,
            min_buffer_packets_network: 50000,
            play_if_buffered_secs: 1.75,
            update_buffered_seconds: true,
            backpressure_poll_ms: 15,
            buffered_report_interval_secs: 1.25,
            wait_for_data_report_cap_secs: 0.25,
            subtitle_extensions: ["ass", "ssa", "srt", "sub", "txt", "vtt"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            replay_gain: ReplayGainConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let seconds = [
            ("play_if_buffered_secs", self.play_if_buffered_secs),
            ("buffered_report_interval_secs", self.buffered_report_interval_secs),
            ("wait_for_data_report_cap_secs", self.wait_for_data_report_cap_secs),
        ];
        for (name, value) in seconds {
            if !value.is_finite() || value < 0.0 {
                return Err(DemuxError::Config(format!("{} 必须是非负数: {}", name, value)));
            }
        }
        if self.backpressure_poll_ms == 0 {
            return Err(DemuxError::Config("backpressure_poll_ms 不能为 0".to_string()));
        }
        if !self.replay_gain.preamp_db.is_finite() {
            return Err(DemuxError::Config("replay_gain.preamp_db 必须是有限值".to_string()));
        }
        Ok(())
    }

    /// 根据源类型选择最小缓冲包数；不使用缓冲的源固定为 1
    pub fn min_buffer_packets(&self, local_stream: bool, dont_use_buffer: bool) -> usize {
        if dont_use_buffer {
            1
        } else if local_stream {
            self.min_buffer_packets_local
        } else {
            self.min_buffer_packets_network
        }
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms)
    }

    /// 等待数据时的统计间隔
    pub fn wait_for_data_interval(&self) -> f64 {
        self.play_if_buffered_secs.min(self.wait_for_data_report_cap_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CoordinatorConfig::from_json_str(
            r#"{ "min_buffer_packets_local": 10, "replay_gain": { "enabled": true } }"#,
        )
        .unwrap();
        assert_eq!(config.min_buffer_packets_local, 10);
        assert_eq!(config.min_buffer_packets_network, 50000);
        assert!(config.replay_gain.enabled);
        assert!(config.replay_gain.prevent_clipping);
    }

    #[test]
    fn test_rejects_negative_seconds() {
        let err = CoordinatorConfig::from_json_str(r#"{ "play_if_buffered_secs": -1.0 }"#).unwrap_err();
        assert!(matches!(err, DemuxError::Config(_)));
        let err = CoordinatorConfig::from_json_str(r#"{ "backpressure_poll_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, DemuxError::Config(_)));
    }

    #[test]
    fn test_min_buffer_packets_by_source() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.min_buffer_packets(true, false), 100);
        assert_eq!(config.min_buffer_packets(false, false), 50000);
        assert_eq!(config.min_buffer_packets(false, true), 1);
        assert_eq!(config.min_buffer_packets(true, true), 1);
    }

    #[test]
    fn test_wait_for_data_interval_is_capped() {
        let mut config = CoordinatorConfig::default();
        assert_eq!(config.wait_for_data_interval(), 0.25);
        config.play_if_buffered_secs = 0.1;
        assert_eq!(config.wait_for_data_interval(), 0.1);
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.json");
        let mut config = CoordinatorConfig::default();
        config.play_if_buffered_secs = 3.0;
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(CoordinatorConfig::from_json_file(&path).unwrap(), config);
    }
}
