//! Point definition records
//!
//! A definitions file holds one record per line. Each record has 13 fields
//! (version 1) or 16 fields (version 2):
//!
//! ```text
//! names longDesc shortDesc units sources enabled inputs outputs translations limits archive period archiveLife [notifications priority guidance]
//! ```
//!
//! Fields are separated by whitespace. `{a,b}` groups several values into
//! one field (alias sets, several sources, stage lists) and `"..."` quotes a
//! literal that may contain spaces. A record with several sources expands
//! into one definition per source.
//!
//! Stage specs inside the stage fields look like `Mean-"60""5"`: the class
//! name, a dash, then quoted arguments.

use crate::error::{EngineError, Result};
use crate::types::Period;
use serde::{Deserialize, Serialize};

/// Fields in a version 1 record
pub const RECORD_FIELDS_V1: usize = 13;

/// Fields in a version 2 record
pub const RECORD_FIELDS_V2: usize = 16;

/// Longest short description kept
pub const SHORT_DESC_LEN: usize = 10;

/// One point definition for a single source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDefinition {
    /// Primary name first, then aliases
    pub names: Vec<String>,
    pub long_desc: String,
    pub short_desc: String,
    pub units: String,
    pub source: String,
    pub enabled: bool,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub translations: Vec<String>,
    pub limits: Vec<String>,
    pub archive: Vec<String>,
    /// Collection period, zero for externally driven points
    #[serde(with = "period_micros")]
    pub period: Period,
    /// Days to keep archived data, -1 for forever
    pub archive_longevity_days: i32,
    pub notifications: Vec<String>,
    /// -1 disables alarm tracking
    pub priority: i32,
    pub guidance: String,
    /// 1-based line in the source text, 0 when built by hand
    pub line: usize,
}

impl PointDefinition {
    /// `source.primaryName`
    pub fn full_name(&self) -> String {
        match self.names.first() {
            Some(name) => format!("{}.{}", self.source, name),
            None => self.source.clone(),
        }
    }

    /// The data source polled for this point, from the first input transaction
    pub fn input_source(&self) -> Option<String> {
        self.inputs.iter().find_map(|spec| transaction_target(spec))
    }

    /// Data sources that receive each new value
    pub fn output_targets(&self) -> Vec<String> {
        self.outputs
            .iter()
            .filter_map(|spec| transaction_target(spec))
            .collect()
    }
}

mod period_micros {
    use crate::types::Period;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(period: &Period, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(period.num_microseconds().unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Period, D::Error> {
        Ok(Period::microseconds(i64::deserialize(d)?))
    }
}

/// Split a line into tokens.
///
/// Whitespace separates tokens; `{...}` yields its contents as one token;
/// a leading `"` yields the quoted text; quotes attached to a word stay part
/// of the word so `EQ-"x * 2"` survives intact. Commas also end a bare word,
/// which is how the contents of a composite are split again.
pub fn get_tokens(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let end = chars.len();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < end {
        while pos < end && matches!(chars[pos], ' ' | '\t' | ',') {
            pos += 1;
        }
        if pos >= end {
            break;
        }

        match chars[pos] {
            '{' => {
                let start = pos + 1;
                while pos < end && chars[pos] != '}' {
                    pos += 1;
                }
                tokens.push(chars[start..pos].iter().collect());
                pos += 1;
            }
            '"' => {
                let start = pos + 1;
                pos += 1;
                while pos < end && chars[pos] != '"' {
                    pos += 1;
                }
                tokens.push(chars[start..pos.min(end)].iter().collect());
                pos += 1;
            }
            _ => {
                let start = pos;
                while pos < end && !matches!(chars[pos], ' ' | '\t' | ',') {
                    if chars[pos] == '"' {
                        pos += 1;
                        while pos < end && chars[pos] != '"' {
                            pos += 1;
                        }
                        if pos < end {
                            pos += 1;
                        }
                    } else {
                        pos += 1;
                    }
                }
                tokens.push(chars[start..pos].iter().collect());
            }
        }
    }

    tokens
}

/// Split a quoted argument list (`"a""b"`) into its arguments
pub fn tok_to_string_array(args: &str) -> Vec<String> {
    args.split('"')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Replace `$1` with the owning point's source
pub fn replace_tok(text: &str, source: &str) -> String {
    text.replace("$1", source)
}

/// True for the placeholders that mean "nothing here"
pub fn is_null_token(token: &str) -> bool {
    let token = token.trim();
    token.is_empty() || token == "-" || token.eq_ignore_ascii_case("null")
}

/// A parsed `Class-"arg1""arg2"` stage spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub class: String,
    pub args: Vec<String>,
}

/// Parse a stage spec. Returns `None` for the `-`/`null` placeholders.
pub fn parse_stage_spec(spec: &str) -> Option<StageSpec> {
    let spec = spec.trim();
    if is_null_token(spec) {
        return None;
    }

    let (class, args) = match spec.find('-') {
        Some(dash) => (&spec[..dash], tok_to_string_array(&spec[dash + 1..])),
        None => (spec, Vec::new()),
    };
    let class = if class.is_empty() { "None" } else { class };

    Some(StageSpec {
        class: class.to_string(),
        args,
    })
}

/// The data source a transaction spec talks to: its first argument, or the class name
fn transaction_target(spec: &str) -> Option<String> {
    let parsed = parse_stage_spec(spec)?;
    Some(parsed.args.into_iter().next().unwrap_or(parsed.class))
}

/// Expand a `TFTF` enabled string to one flag per source
pub fn parse_enabled(flags: &str, sources: usize) -> Vec<bool> {
    let parsed: Vec<bool> = flags.chars().map(|c| c == 't' || c == 'T').collect();
    if parsed.len() < sources {
        let first = parsed.first().copied().unwrap_or(false);
        vec![first; sources]
    } else {
        parsed
    }
}

fn parse_period(text: &str, line: usize) -> Result<Period> {
    if is_null_token(text) {
        return Ok(Period::zero());
    }
    let micros: i64 = text.trim().parse().map_err(|_| EngineError::Parse {
        line,
        message: format!("Bad period \"{}\"", text),
    })?;
    Ok(Period::microseconds(micros.max(0)))
}

fn parse_signed(text: &str, line: usize, what: &str) -> Result<i32> {
    if is_null_token(text) {
        return Ok(-1);
    }
    text.trim().parse().map_err(|_| EngineError::Parse {
        line,
        message: format!("Bad {} \"{}\"", what, text),
    })
}

/// Parse one record into one definition per source
pub fn parse_line(text: &str, line: usize) -> Result<Vec<PointDefinition>> {
    let toks = get_tokens(text);
    if toks.len() != RECORD_FIELDS_V1 && toks.len() != RECORD_FIELDS_V2 {
        return Err(EngineError::Parse {
            line,
            message: format!(
                "Expect {} or {} tokens, found {}",
                RECORD_FIELDS_V1,
                RECORD_FIELDS_V2,
                toks.len()
            ),
        });
    }

    let names = get_tokens(&toks[0]);
    if names.is_empty() {
        return Err(EngineError::Parse {
            line,
            message: "Point has no name".to_string(),
        });
    }
    let sources = get_tokens(&toks[4]);
    if sources.is_empty() {
        return Err(EngineError::Parse {
            line,
            message: format!("Point {} has no source", names[0]),
        });
    }

    let short_desc: String = toks[2].chars().take(SHORT_DESC_LEN).collect();
    let enabled = parse_enabled(&toks[5], sources.len());
    let period = parse_period(&toks[11], line)?;
    let archive_longevity_days = parse_signed(&toks[12], line, "archive longevity")?;

    let (notifications, priority, guidance) = if toks.len() == RECORD_FIELDS_V2 {
        (
            get_tokens(&toks[13]),
            parse_signed(&toks[14], line, "priority")?,
            toks[15].clone(),
        )
    } else {
        (Vec::new(), -1, String::new())
    };

    let definitions = sources
        .iter()
        .enumerate()
        .map(|(i, source)| PointDefinition {
            names: names.clone(),
            long_desc: toks[1].clone(),
            short_desc: short_desc.clone(),
            units: toks[3].clone(),
            source: source.clone(),
            enabled: enabled.get(i).copied().unwrap_or(false),
            inputs: get_tokens(&toks[6]),
            outputs: get_tokens(&toks[7]),
            translations: get_tokens(&toks[8]),
            limits: get_tokens(&toks[9]),
            archive: get_tokens(&toks[10]),
            period,
            archive_longevity_days,
            notifications: notifications.clone(),
            priority,
            guidance: guidance.clone(),
            line,
        })
        .collect();

    Ok(definitions)
}

/// Strip comments and blank lines, keeping original line numbers
pub fn record_lines(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut in_block = false;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if in_block {
            if line.contains("*/") {
                in_block = false;
            }
            continue;
        }
        if line.starts_with("/*") {
            in_block = !line.contains("*/");
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        out.push((idx + 1, line));
    }

    out
}

/// Parse a whole definitions text.
///
/// Bad records are reported and skipped; the rest are returned.
pub fn parse_definitions(text: &str) -> (Vec<PointDefinition>, Vec<EngineError>) {
    let mut definitions = Vec::new();
    let mut errors = Vec::new();

    for (line, record) in record_lines(text) {
        match parse_line(record, line) {
            Ok(mut defs) => definitions.append(&mut defs),
            Err(e) => {
                tracing::error!("While parsing point definition line {}: {}", line, e);
                errors.push(e);
            }
        }
    }

    (definitions, errors)
}
