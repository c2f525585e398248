//! 时间周期与分桶
//!
//! 所有时间运算统一使用毫秒时间戳，避免秒级小数带来的漂移。

use crate::klcommon::{AppError, Result};
use std::fmt;

/// 计算时间戳所属周期桶的起始时间
///
/// `bucket_start(t, d) <= t < bucket_start(t, d) + d`，且结果总是 `d` 的整数倍。
/// 对负时间戳同样向下取整。
pub fn bucket_start(timestamp_ms: i64, duration_ms: i64) -> i64 {
    debug_assert!(duration_ms > 0);
    timestamp_ms.div_euclid(duration_ms) * duration_ms
}

/// 将时间间隔转换为毫秒数
/// 例如: "1m" -> 60000, "1h" -> 3600000
///
/// 无法识别的格式返回 `ConfigError`
pub fn interval_to_milliseconds(interval: &str) -> Result<i64> {
    let interval = interval.trim();
    let unit = interval
        .chars()
        .last()
        .ok_or_else(|| AppError::ConfigError("时间周期不能为空".to_string()))?;
    let value: i64 = interval[..interval.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| AppError::ConfigError(format!("无效的时间周期: {}", interval)))?;

    if value <= 0 {
        return Err(AppError::ConfigError(format!("时间周期必须为正数: {}", interval)));
    }

    let unit_ms = match unit {
        'm' => 60 * 1000,                 // 分钟
        'h' => 60 * 60 * 1000,            // 小时
        'd' => 24 * 60 * 60 * 1000,       // 天
        'w' => 7 * 24 * 60 * 60 * 1000,   // 周
        _ => return Err(AppError::ConfigError(format!("无效的时间周期单位: {}", interval))),
    };

    Ok(value * unit_ms)
}

/// 单个时间周期，例如 5m = 300000ms
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timeframe {
    pub name: String,
    pub duration_ms: i64,
}

impl Timeframe {
    pub fn parse(name: &str) -> Result<Self> {
        Ok(Self {
            name: name.trim().to_string(),
            duration_ms: interval_to_milliseconds(name)?,
        })
    }

    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        bucket_start(timestamp_ms, self.duration_ms)
    }

    /// 派生视图表名，例如 `candle_data_5m`
    pub fn view_name(&self) -> String {
        format!("candle_data_{}", self.name)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// 基础周期 + 按时长升序排列的派生周期集合
#[derive(Debug, Clone)]
pub struct TimeframeSet {
    base: Timeframe,
    derived: Vec<Timeframe>,
}

impl TimeframeSet {
    /// 每个派生周期必须严格长于基础周期，且为其整数倍
    pub fn new(base: Timeframe, mut derived: Vec<Timeframe>) -> Result<Self> {
        derived.sort_by_key(|tf| tf.duration_ms);

        for tf in &derived {
            if tf.duration_ms <= base.duration_ms {
                return Err(AppError::ConfigError(format!(
                    "派生周期 {} 必须长于基础周期 {}", tf, base
                )));
            }
            if tf.duration_ms % base.duration_ms != 0 {
                return Err(AppError::ConfigError(format!(
                    "派生周期 {} 不是基础周期 {} 的整数倍", tf, base
                )));
            }
        }

        for pair in derived.windows(2) {
            if pair[0].duration_ms == pair[1].duration_ms {
                return Err(AppError::ConfigError(format!(
                    "重复的派生周期: {} / {}", pair[0], pair[1]
                )));
            }
        }

        Ok(Self { base, derived })
    }

    pub fn from_names(base: &str, derived: &[String]) -> Result<Self> {
        let base = Timeframe::parse(base)?;
        let derived = derived
            .iter()
            .map(|name| Timeframe::parse(name))
            .collect::<Result<Vec<_>>>()?;
        Self::new(base, derived)
    }

    pub fn base(&self) -> &Timeframe {
        &self.base
    }

    pub fn derived(&self) -> &[Timeframe] {
        &self.derived
    }

    /// 一个派生周期桶需要的基础K线根数
    pub fn base_units_per(&self, timeframe: &Timeframe) -> i64 {
        timeframe.duration_ms / self.base.duration_ms
    }

    pub fn find(&self, name: &str) -> Option<&Timeframe> {
        std::iter::once(&self.base)
            .chain(self.derived.iter())
            .find(|tf| tf.name == name)
    }
}
