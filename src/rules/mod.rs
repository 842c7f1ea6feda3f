//! Reward rule engine
//!
//! Pure scoring of one account-hour of activity. The engine takes the
//! quality signals the rollup produced (uptime %, mean download Mbps,
//! device risk) and a versioned rule, and returns the point award with a
//! multiplier breakdown. No clock, no I/O — callers pass everything in.

use serde::{Deserialize, Serialize};

/// A `[min, max]` risk range mapped to a reward multiplier. `max: None`
/// leaves the band open-ended at the top.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskBand {
    pub min: u8,
    pub max: Option<u8>,
    pub mult: f64,
}

impl RiskBand {
    fn contains(&self, risk: u8) -> bool {
        risk >= self.min && self.max.map_or(true, |max| risk <= max)
    }
}

/// Versioned scoring rule. Persisted on every ledger event it produces so
/// historical awards stay explainable after the rule changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardRule {
    pub rule_version: u32,
    pub base_points_per_hour: i64,
    pub min_uptime_pct_to_earn: f64,
    pub uptime_linear_start: f64,
    pub uptime_linear_end: f64,
    pub min_download_mbps_to_earn: f64,
    pub bw_linear_start: f64,
    pub bw_linear_end: f64,
    /// Risk at or above this value freezes earning entirely.
    pub freeze_risk: u8,
    /// First matching band wins; no match falls back to full multiplier.
    pub risk_multipliers: Vec<RiskBand>,
}

impl Default for RewardRule {
    fn default() -> Self {
        Self {
            rule_version: 1,
            base_points_per_hour: 60,
            min_uptime_pct_to_earn: 10.0,
            uptime_linear_start: 10.0,
            uptime_linear_end: 100.0,
            min_download_mbps_to_earn: 5.0,
            bw_linear_start: 5.0,
            bw_linear_end: 100.0,
            freeze_risk: 10,
            risk_multipliers: vec![
                RiskBand { min: 0, max: Some(2), mult: 1.0 },
                RiskBand { min: 3, max: Some(5), mult: 0.7 },
                RiskBand { min: 6, max: Some(9), mult: 0.4 },
                RiskBand { min: 10, max: None, mult: 0.0 },
            ],
        }
    }
}

impl RewardRule {
    /// Sanity-check the rule shape. Called from config validation.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_points_per_hour <= 0 {
            return Err("base_points_per_hour must be positive".into());
        }
        if self.uptime_linear_end <= self.uptime_linear_start {
            return Err("uptime ramp must have start < end".into());
        }
        if self.bw_linear_end <= self.bw_linear_start {
            return Err("bandwidth ramp must have start < end".into());
        }
        if !(0.0..=100.0).contains(&self.min_uptime_pct_to_earn) {
            return Err("min_uptime_pct_to_earn must be within 0..=100".into());
        }
        for band in &self.risk_multipliers {
            if let Some(max) = band.max {
                if max < band.min {
                    return Err(format!("risk band {}..{} is inverted", band.min, max));
                }
            }
            if !(0.0..=1.0).contains(&band.mult) {
                return Err("risk multipliers must be within 0..=1".into());
            }
        }
        Ok(())
    }
}

/// Quality signals for one account over one scoring window.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInput {
    pub uptime_pct: f64,
    pub download_mbps: f64,
    pub risk_score: u8,
}

/// Why a score came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreReason {
    Ok,
    RiskFrozen,
    UptimeTooLow,
    BandwidthTooLow,
    ZeroPoints,
}

impl ScoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreReason::Ok => "ok",
            ScoreReason::RiskFrozen => "risk_frozen",
            ScoreReason::UptimeTooLow => "uptime_too_low",
            ScoreReason::BandwidthTooLow => "bandwidth_too_low",
            ScoreReason::ZeroPoints => "zero_points",
        }
    }
}

/// Per-factor multipliers that produced the final award.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub uptime_mult: f64,
    pub bandwidth_mult: f64,
    pub risk_mult: f64,
}

/// Scoring result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub eligible: bool,
    pub points: i64,
    pub breakdown: ScoreBreakdown,
    pub reason: ScoreReason,
}

impl Score {
    fn ineligible(reason: ScoreReason) -> Self {
        Self {
            eligible: false,
            points: 0,
            breakdown: ScoreBreakdown {
                uptime_mult: 0.0,
                bandwidth_mult: 0.0,
                risk_mult: 0.0,
            },
            reason,
        }
    }
}

fn linear_ramp(value: f64, start: f64, end: f64) -> f64 {
    ((value - start) / (end - start)).clamp(0.0, 1.0)
}

/// Score one window of activity against a rule.
///
/// Gate order matters: risk freeze first, then uptime, then bandwidth.
pub fn score(rule: &RewardRule, input: ScoreInput) -> Score {
    if input.risk_score >= rule.freeze_risk {
        return Score::ineligible(ScoreReason::RiskFrozen);
    }
    if input.uptime_pct < rule.min_uptime_pct_to_earn {
        return Score::ineligible(ScoreReason::UptimeTooLow);
    }
    if input.download_mbps < rule.min_download_mbps_to_earn {
        return Score::ineligible(ScoreReason::BandwidthTooLow);
    }

    let uptime_mult = linear_ramp(input.uptime_pct, rule.uptime_linear_start, rule.uptime_linear_end);
    let bandwidth_mult = linear_ramp(input.download_mbps, rule.bw_linear_start, rule.bw_linear_end);
    let risk_mult = rule
        .risk_multipliers
        .iter()
        .find(|band| band.contains(input.risk_score))
        .map(|band| band.mult)
        .unwrap_or(1.0);

    let points = (rule.base_points_per_hour as f64 * uptime_mult * bandwidth_mult * risk_mult)
        .floor() as i64;
    let eligible = points > 0;

    Score {
        eligible,
        points,
        breakdown: ScoreBreakdown {
            uptime_mult,
            bandwidth_mult,
            risk_mult,
        },
        reason: if eligible { ScoreReason::Ok } else { ScoreReason::ZeroPoints },
    }
}
