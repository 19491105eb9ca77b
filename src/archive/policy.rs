//! Archive policies
//!
//! Each point carries an ordered list of policies parsed from its archive
//! field. For every valid sample the policies are asked in order whether to
//! archive it; the first that says yes wins and the rest are not consulted
//! for that sample.

use crate::config::points::parse_stage_spec;
use crate::error::{EngineError, Result};
use crate::types::{period_from_secs_f64, Period, Sample, Timestamp, Value};

/// Threshold variant of the change policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChangeThreshold {
    /// Any change at all
    Any,
    /// Absolute difference at least this large
    Absolute(f64),
    /// Difference relative to the last archived value, in percent
    Percent(f64),
}

/// One archive decision rule with its running state
#[derive(Debug, Clone, PartialEq)]
pub enum ArchivePolicy {
    All,
    Change {
        threshold: ChangeThreshold,
        last: Option<Value>,
    },
    Counter {
        cycles: u32,
        running: u32,
    },
    Timer {
        period: Period,
        last_saved: Option<Timestamp>,
    },
    OnIncrease {
        last: Option<f64>,
    },
    OnDecrease {
        last: Option<f64>,
    },
}

impl ArchivePolicy {
    /// Parse one policy spec such as `CHANGE-"0.5"` or `COUNTER-"5"`
    pub fn parse(spec: &str) -> Result<Option<Self>> {
        let Some(parsed) = parse_stage_spec(spec) else {
            return Ok(None);
        };
        let arg = parsed.args.first().map(|s| s.trim());
        let class = parsed.class.as_str();

        let policy = match class.to_ascii_uppercase().as_str() {
            "ALL" => ArchivePolicy::All,
            "CHANGE" => {
                let threshold = match arg {
                    None => ChangeThreshold::Any,
                    Some(a) if a.ends_with('%') => {
                        ChangeThreshold::Percent(parse_number(class, a.trim_end_matches('%'))?)
                    }
                    Some(a) => ChangeThreshold::Absolute(parse_number(class, a)?),
                };
                ArchivePolicy::Change {
                    threshold,
                    last: None,
                }
            }
            "COUNTER" => {
                let cycles = arg
                    .ok_or_else(|| EngineError::stage_args(class, "requires a cycle count"))?
                    .parse::<u32>()
                    .map_err(|e| EngineError::stage_args(class, e.to_string()))?;
                ArchivePolicy::Counter {
                    cycles: cycles.max(1),
                    running: 0,
                }
            }
            "TIMER" => {
                let secs = parse_number(
                    class,
                    arg.ok_or_else(|| EngineError::stage_args(class, "requires a period"))?,
                )?;
                ArchivePolicy::Timer {
                    period: period_from_secs_f64(secs),
                    last_saved: None,
                }
            }
            "ONINCREASE" => ArchivePolicy::OnIncrease { last: None },
            "ONDECREASE" => ArchivePolicy::OnDecrease { last: None },
            _ => {
                return Err(EngineError::UnknownStage(format!("archive policy {}", class)));
            }
        };

        Ok(Some(policy))
    }

    /// Parse every spec in an archive field
    pub fn parse_all(specs: &[String]) -> Result<Vec<Self>> {
        let mut policies = Vec::new();
        for spec in specs {
            if let Some(p) = Self::parse(spec)? {
                policies.push(p);
            }
        }
        Ok(policies)
    }

    /// Decide whether this sample should be archived, updating state
    pub fn check(&mut self, sample: &Sample) -> bool {
        match self {
            ArchivePolicy::All => true,
            ArchivePolicy::Change { threshold, last } => {
                let new = sample.value();
                let save = match (last.as_ref(), new) {
                    (None, None) => false,
                    (None, Some(_)) | (Some(_), None) => true,
                    (Some(old), Some(new)) => match (old.as_f64(), new.as_f64()) {
                        (Some(o), Some(n)) if old.is_number() && new.is_number() => {
                            let delta = (n - o).abs();
                            match threshold {
                                ChangeThreshold::Any => delta != 0.0,
                                ChangeThreshold::Absolute(t) => delta >= *t,
                                ChangeThreshold::Percent(p) => {
                                    (o == 0.0 && delta != 0.0) || delta / o.abs() * 100.0 >= *p
                                }
                            }
                        }
                        _ => old != new,
                    },
                };
                if save {
                    *last = new.cloned();
                }
                save
            }
            ArchivePolicy::Counter { cycles, running } => {
                *running += 1;
                if *running >= *cycles {
                    *running = 0;
                    true
                } else {
                    false
                }
            }
            ArchivePolicy::Timer { period, last_saved } => {
                let due = match last_saved {
                    None => true,
                    Some(t) => sample.timestamp() > *t + *period,
                };
                if due {
                    *last_saved = Some(sample.timestamp());
                }
                due
            }
            ArchivePolicy::OnIncrease { last } => {
                let new = sample.as_f64();
                let save = matches!((*last, new), (Some(o), Some(n)) if n > o);
                *last = new;
                save
            }
            ArchivePolicy::OnDecrease { last } => {
                let new = sample.as_f64();
                let save = matches!((*last, new), (Some(o), Some(n)) if n < o);
                *last = new;
                save
            }
        }
    }
}

/// First policy that says yes wins
pub fn should_archive(policies: &mut [ArchivePolicy], sample: &Sample) -> bool {
    policies.iter_mut().any(|p| p.check(sample))
}

fn parse_number(class: &str, text: &str) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|e| EngineError::stage_args(class, format!("\"{}\": {}", text, e)))
}
