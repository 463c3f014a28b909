use crate::core::ReplayGainConfig;
use crate::player::stream_reader::StreamReader;

/// dB 转线性倍数
fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// 根据读取到的 (增益 dB, 峰值) 计算音量倍数
///
/// 防削波打开且 `peak * gain > 1.0` 时，把增益限制为 `1 / peak`。
pub fn compute(gain_db: f32, peak: f32, config: &ReplayGainConfig) -> f64 {
    let peak = peak as f64;
    let gain = db_to_linear(gain_db as f64) * db_to_linear(config.preamp_db);
    if config.prevent_clipping && peak > 0.0 && peak * gain > 1.0 {
        1.0 / peak
    } else {
        gain
    }
}

/// 会话使用的 ReplayGain；未启用或源没有提供时为 1.0
pub fn for_reader(reader: &dyn StreamReader, config: &ReplayGainConfig) -> f64 {
    if !config.enabled {
        return 1.0;
    }
    match reader.replay_gain(config.album) {
        Some((gain_db, peak)) => compute(gain_db, peak, config),
        None => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(prevent_clipping: bool) -> ReplayGainConfig {
        ReplayGainConfig {
            enabled: true,
            album: false,
            preamp_db: 0.0,
            prevent_clipping,
        }
    }

    #[test]
    fn test_clipping_prevention_clamps_gain() {
        let raw = compute(6.0, 0.9, &config(false));
        assert!((raw - 1.995).abs() < 0.001);

        let clamped = compute(6.0, 0.9, &config(true));
        assert!((clamped - 1.0 / 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_no_clamp_below_unity() {
        let gain = compute(-6.0, 0.9, &config(true));
        assert!((gain - 0.501).abs() < 0.001);
    }

    #[test]
    fn test_preamp_is_added() {
        let mut cfg = config(false);
        cfg.preamp_db = 6.0;
        let gain = compute(0.0, 1.0, &cfg);
        assert!((gain - 1.995).abs() < 0.001);
    }
}
