//! Stateless stages: each output depends only on the current input
//!
//! Unless noted otherwise a sample without a value passes straight
//! through so that "no data" reaches the end of the chain.

use crate::config::points::replace_tok;
use crate::error::{EngineError, Result};
use crate::scripting::CompiledExpression;
use crate::stage::{
    parse_arg, parse_flag, parse_opt, require_args, unexpected_input, Stage, StageContext,
    StageInit, StageRegistry,
};
use crate::types::{parse_as_bool, Sample, Value};
use std::collections::HashMap;

pub(crate) fn register(registry: &mut StageRegistry) {
    registry.register("None", |_| Ok(Box::new(Identity)));
    registry.register("EQ", Equation::create);
    registry.register("Polynomial", Polynomial::create);
    registry.register("BitShift", BitShift::create);
    registry.register("Squelch", Squelch::create);
    registry.register("StringMap", StringMap::create);
    registry.register("EnumMap", EnumMap::create);
    registry.register("NumberToBool", NumberToBool::create);
    registry.register("AngleToNumber", AngleToNumber::create);
    registry.register("NumberToAngle", NumberToAngle::create);
    registry.register("FormatString", FormatString::create);
    registry.register("StringToNumber", StringToNumber::create);
    registry.register("NV", NamedValue::create);
    registry.register("BytesToString", BytesToString::create);
    registry.register("DewPoint", |_| Ok(Box::new(DewPoint)));
    registry.register("RoundToInt", |_| Ok(Box::new(RoundToInt)));
    registry.register("NumDecimals", NumDecimals::create);
    registry.register("StringCase", StringCase::create);
    registry.register("StringTrim", |_| Ok(Box::new(StringTrim)));
    registry.register("StringReplace", StringReplace::create);
    registry.register("Substring", Substring::create);
    registry.register("StopIfNull", |_| Ok(Box::new(StopIfNull)));
    registry.register("CopyTimestamp", CopyTimestamp::create);
}

/// Split off the value, or pass a null sample straight through
macro_rules! value_or_pass {
    ($input:expr) => {
        match $input.value() {
            Some(v) => v.clone(),
            None => return Ok(Some($input)),
        }
    };
}

fn require_number(class: &str, input: &Sample) -> Result<f64> {
    match input.value() {
        Some(v) if v.is_number() => v.as_f64().ok_or_else(|| unexpected_input(class, input, "numeric")),
        _ => Err(unexpected_input(class, input, "numeric")),
    }
}

// ==================== None ====================

/// Passes input through unchanged
#[derive(Debug, Default)]
pub struct Identity;

impl Stage for Identity {
    fn name(&self) -> &str {
        "None"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        Ok(Some(input))
    }
}

// ==================== EQ ====================

/// Evaluates an expression of `x` (or `X`)
///
/// Integer input gives integer output. Arrays are mapped element by element.
pub struct Equation {
    expr: CompiledExpression,
}

impl Equation {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "an expression of x")?;
        let expr = init
            .scripts
            .compile(&format!("{} EQ", init.point.full_name), &init.args[0])?;
        Ok(Box::new(Self { expr }))
    }

    fn apply(&self, ctx: &StageContext<'_>, value: &Value) -> Result<Option<Value>> {
        let x = match value.as_f64() {
            Some(x) => x,
            None => return Ok(None),
        };
        let y = ctx.engine.scripts().evaluate(&self.expr, &[("x", x), ("X", x)])?;
        Ok(Some(match value {
            Value::Int(_) => Value::Int(y as i64),
            _ => Value::Float(y),
        }))
    }
}

impl Stage for Equation {
    fn name(&self) -> &str {
        "EQ"
    }

    fn translate(&mut self, input: Sample, ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let value = value_or_pass!(input);
        let out = match &value {
            Value::Array(items) => {
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    match self.apply(ctx, item)? {
                        Some(v) => mapped.push(v),
                        None => return Err(unexpected_input("EQ", &input, "numeric array")),
                    }
                }
                Value::Array(mapped)
            }
            other => match self.apply(ctx, other)? {
                Some(v) => v,
                None => return Err(unexpected_input("EQ", &input, "numeric")),
            },
        };
        Ok(Some(input.with_value(Some(out))))
    }
}

// ==================== Polynomial ====================

/// `c0 + c1*x + c2*x^2 + ...`; args are the order (coefficient count)
/// followed by the coefficients
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    coeffs: Vec<f64>,
}

impl Polynomial {
    pub fn new(coeffs: Vec<f64>) -> Self {
        Self { coeffs }
    }

    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let order: usize = parse_arg(init.class, init.args, 0, "order")?;
        if !(1..=20).contains(&order) {
            return Err(EngineError::stage_args(init.class, "order must be 1 to 20"));
        }
        require_args(init.class, init.args, order + 1, "order and coefficients")?;
        let coeffs = (0..order)
            .map(|i| parse_arg(init.class, init.args, i + 1, "coefficient"))
            .collect::<Result<Vec<f64>>>()?;
        Ok(Box::new(Self::new(coeffs)))
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.coeffs.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }
}

impl Stage for Polynomial {
    fn name(&self) -> &str {
        "Polynomial"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        if !input.is_valid() {
            return Ok(Some(input));
        }
        let x = require_number("Polynomial", &input)?;
        Ok(Some(input.with_value(Some(Value::Float(self.eval(x))))))
    }
}

// ==================== BitShift ====================

/// `(value & mask) >> shift`
#[derive(Debug)]
pub struct BitShift {
    mask: i64,
    shift: u32,
}

impl BitShift {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 2, "mask and shift")?;
        let mask = parse_arg(init.class, init.args, 0, "mask")?;
        let shift: u32 = parse_arg(init.class, init.args, 1, "shift")?;
        if shift > 63 {
            return Err(EngineError::stage_args(init.class, "shift must be below 64"));
        }
        Ok(Box::new(Self { mask, shift }))
    }
}

impl Stage for BitShift {
    fn name(&self) -> &str {
        "BitShift"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        if !input.is_valid() {
            return Ok(Some(input));
        }
        let v = require_number("BitShift", &input)? as i64;
        Ok(Some(input.with_value(Some(Value::Int((v & self.mask) >> self.shift)))))
    }
}

// ==================== Squelch ====================

/// Values below a threshold are replaced by a fixed output
#[derive(Debug)]
pub struct Squelch {
    threshold: f64,
    output: f64,
}

impl Squelch {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let threshold = parse_arg(init.class, init.args, 0, "threshold")?;
        let output = parse_opt(init.class, init.args, 1, "output")?.unwrap_or(0.0);
        Ok(Box::new(Self { threshold, output }))
    }
}

impl Stage for Squelch {
    fn name(&self) -> &str {
        "Squelch"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        if !input.is_valid() {
            return Ok(Some(input));
        }
        let v = require_number("Squelch", &input)?;
        let out = if v < self.threshold { self.output } else { v };
        Ok(Some(input.with_value(Some(Value::Float(out)))))
    }
}

// ==================== StringMap / EnumMap ====================

/// `"in:out"` string substitutions; unmapped strings pass unchanged
#[derive(Debug)]
pub struct StringMap {
    map: HashMap<String, String>,
}

impl StringMap {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let map = init
            .args
            .iter()
            .filter_map(|a| a.split_once(':'))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok(Box::new(Self { map }))
    }
}

impl Stage for StringMap {
    fn name(&self) -> &str {
        "StringMap"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let value = value_or_pass!(input);
        let text = value.to_string();
        let out = self.map.get(&text).cloned().unwrap_or(text);
        Ok(Some(input.with_value(Some(Value::Str(out)))))
    }
}

/// `"n:label"` integer to label mapping; a bare argument replaces the
/// `INVALID` default
#[derive(Debug)]
pub struct EnumMap {
    map: HashMap<i64, String>,
    default: String,
}

impl EnumMap {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let mut map = HashMap::new();
        let mut default = "INVALID".to_string();
        for arg in init.args {
            match arg.split_once(':') {
                Some((k, v)) => {
                    let k: i64 = k.trim().parse().map_err(|_| {
                        EngineError::stage_args(init.class, format!("bad enum value \"{}\"", k))
                    })?;
                    map.insert(k, v.trim().to_string());
                }
                None => default = arg.clone(),
            }
        }
        Ok(Box::new(Self { map, default }))
    }
}

impl Stage for EnumMap {
    fn name(&self) -> &str {
        "EnumMap"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        if !input.is_valid() {
            return Ok(Some(input));
        }
        let Some(v) = input.value().filter(|v| v.is_number()).and_then(Value::as_f64) else {
            return Ok(None);
        };
        let label = self.map.get(&(v as i64)).unwrap_or(&self.default).clone();
        Ok(Some(input.with_value(Some(Value::Str(label)))))
    }
}

// ==================== Conversions ====================

/// Any boolean-like input to a bool, optionally inverted
#[derive(Debug)]
pub struct NumberToBool {
    invert: bool,
}

impl NumberToBool {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let invert = init.args.first().is_some_and(|a| parse_flag(a));
        Ok(Box::new(Self { invert }))
    }
}

impl Stage for NumberToBool {
    fn name(&self) -> &str {
        "NumberToBool"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let out = input
            .value()
            .and_then(parse_as_bool)
            .map(|b| Value::Bool(b != self.invert));
        if out.is_none() && input.is_valid() {
            let kind = input.value().map_or("null", |v| v.kind());
            tracing::warn!("({}) NumberToBool: cannot read {} as bool", input.name(), kind);
        }
        Ok(Some(input.with_value(out)))
    }
}

fn degrees_flag(class: &str, args: &[String]) -> Result<bool> {
    match args.first().map(|a| a.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(a) if a == "d" => Ok(true),
        Some(a) if a == "r" => Ok(false),
        Some(a) => Err(EngineError::stage_args(class, format!("expected \"d\" or \"r\", got \"{}\"", a))),
    }
}

/// Angle to a plain number in radians, or degrees with `"d"`
#[derive(Debug)]
pub struct AngleToNumber {
    degrees: bool,
}

impl AngleToNumber {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        Ok(Box::new(Self {
            degrees: degrees_flag(init.class, init.args)?,
        }))
    }
}

impl Stage for AngleToNumber {
    fn name(&self) -> &str {
        "AngleToNumber"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        match input.value() {
            None => Ok(Some(input)),
            Some(Value::Angle(rad)) => {
                let v = if self.degrees { rad.to_degrees() } else { *rad };
                Ok(Some(input.with_value(Some(Value::Float(v)))))
            }
            Some(_) => Err(unexpected_input("AngleToNumber", &input, "angle")),
        }
    }
}

/// Number (radians, or degrees with `"d"`) to an angle
#[derive(Debug)]
pub struct NumberToAngle {
    degrees: bool,
}

impl NumberToAngle {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        Ok(Box::new(Self {
            degrees: degrees_flag(init.class, init.args)?,
        }))
    }
}

impl Stage for NumberToAngle {
    fn name(&self) -> &str {
        "NumberToAngle"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        if !input.is_valid() {
            return Ok(Some(input));
        }
        let v = require_number("NumberToAngle", &input)?;
        let rad = if self.degrees { v.to_radians() } else { v };
        Ok(Some(input.with_value(Some(Value::Angle(rad)))))
    }
}

/// Formats the value with a printf-style pattern, or `dhms` for a
/// duration in seconds
#[derive(Debug)]
pub struct FormatString {
    format: String,
}

impl FormatString {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "a format")?;
        Ok(Box::new(Self {
            format: init.args[0].clone(),
        }))
    }
}

impl Stage for FormatString {
    fn name(&self) -> &str {
        "FormatString"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let value = value_or_pass!(input);
        let text = if self.format == "dhms" {
            let secs = value
                .as_f64()
                .ok_or_else(|| unexpected_input("FormatString", &input, "numeric"))?;
            format_dhms(secs as i64)
        } else {
            printf(&self.format, &value)
        };
        Ok(Some(input.with_value(Some(Value::Str(text)))))
    }
}

/// `HH:MM:SS`, with a `Nd ` prefix once past a day
pub fn format_dhms(total: i64) -> String {
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if days == 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
    }
}

/// Minimal printf: `%[-+0][width][.precision](d|f|e|x|X|s)` and `%%`
pub fn printf(format: &str, value: &Value) -> String {
    let mut out = String::new();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let (mut left, mut plus, mut zero) = (false, false, false);
        while let Some(&f) = chars.peek() {
            match f {
                '-' => left = true,
                '+' => plus = true,
                '0' => zero = true,
                _ => break,
            }
            chars.next();
        }
        let mut width = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + d as usize;
            chars.next();
        }
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                p = p * 10 + d as usize;
                chars.next();
            }
            precision = Some(p);
        }

        let Some(conv) = chars.next() else {
            out.push('%');
            break;
        };
        let number = value.as_f64();
        let mut body = match (conv, number) {
            ('d', Some(v)) => format!("{}", v.trunc() as i64),
            ('f', Some(v)) => format!("{:.*}", precision.unwrap_or(6), v),
            ('e', Some(v)) => format!("{:.*e}", precision.unwrap_or(6), v),
            ('x', Some(v)) => format!("{:x}", v as i64),
            ('X', Some(v)) => format!("{:X}", v as i64),
            ('s', _) => {
                let s = value.to_string();
                match precision {
                    Some(p) => s.chars().take(p).collect(),
                    None => s,
                }
            }
            (_, _) => value.to_string(),
        };
        let numeric = conv != 's' && number.is_some();
        if plus && numeric && !body.starts_with('-') {
            body.insert(0, '+');
        }

        let len = body.chars().count();
        if len < width {
            let pad = width - len;
            if left {
                body.push_str(&" ".repeat(pad));
            } else if zero && numeric {
                let sign = if body.starts_with('-') || body.starts_with('+') { 1 } else { 0 };
                body.insert_str(sign, &"0".repeat(pad));
            } else {
                body.insert_str(0, &" ".repeat(pad));
            }
        }
        out.push_str(&body);
    }

    out
}

/// Parses strings as `Float`/`Double` or `Integer` with an optional radix
#[derive(Debug)]
pub struct StringToNumber {
    integer: bool,
    radix: u32,
}

impl StringToNumber {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "a numeric type name")?;
        let integer = match init.args[0].trim().to_ascii_lowercase().as_str() {
            "integer" | "int" | "long" => true,
            "float" | "double" => false,
            other => {
                return Err(EngineError::stage_args(
                    init.class,
                    format!("unknown numeric type \"{}\"", other),
                ))
            }
        };
        let radix = parse_opt(init.class, init.args, 1, "radix")?.unwrap_or(10);
        if !(2..=36).contains(&radix) {
            return Err(EngineError::stage_args(init.class, "radix must be 2 to 36"));
        }
        Ok(Box::new(Self { integer, radix }))
    }
}

impl Stage for StringToNumber {
    fn name(&self) -> &str {
        "StringToNumber"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let value = value_or_pass!(input);
        let Some(text) = value.as_str().map(str::trim) else {
            return Err(unexpected_input("StringToNumber", &input, "string"));
        };
        let parsed = if self.integer {
            i64::from_str_radix(text, self.radix).ok().map(Value::Int)
        } else {
            text.parse::<f64>().ok().map(Value::Float)
        };
        Ok(Some(input.with_value(parsed)))
    }
}

/// Extracts one entry from a map value
#[derive(Debug)]
pub struct NamedValue {
    key: String,
}

impl NamedValue {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "a key")?;
        Ok(Box::new(Self {
            key: init.args[0].clone(),
        }))
    }
}

impl Stage for NamedValue {
    fn name(&self) -> &str {
        "NV"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        match input.value() {
            None => Ok(Some(input)),
            Some(Value::Map(map)) => {
                let out = map.get(&self.key).cloned();
                Ok(Some(input.with_value(out)))
            }
            Some(_) => Err(unexpected_input("NV", &input, "map")),
        }
    }
}

/// Packs the bytes of a run of integer registers into a string
///
/// Args: order (0 reads each register low byte first, 1 high byte first),
/// start index, register count, and an optional `legacy` flag. With
/// `legacy`, order 0 also appends the order-1 reading of every register.
/// Zero bytes are skipped.
#[derive(Debug)]
pub struct BytesToString {
    order: u8,
    start: usize,
    length: usize,
    legacy: bool,
}

impl BytesToString {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 3, "order, start and length")?;
        let order = parse_arg(init.class, init.args, 0, "order")?;
        let start = parse_arg(init.class, init.args, 1, "start index")?;
        let length = parse_arg(init.class, init.args, 2, "length")?;
        let legacy = init
            .args
            .get(3)
            .is_some_and(|a| a.trim().eq_ignore_ascii_case("legacy") || parse_flag(a));
        Ok(Box::new(Self {
            order,
            start,
            length,
            legacy,
        }))
    }

    fn push_bytes(out: &mut String, reg: i64, high_first: bool) {
        for k in 0..8 {
            let shift = if high_first { 56 - 8 * k } else { 8 * k };
            let byte = ((reg >> shift) & 0xFF) as u8;
            if byte != 0 {
                out.push(byte as char);
            }
        }
    }

    pub fn decode(&self, registers: &[Value]) -> String {
        let mut out = String::new();
        for reg in registers.iter().skip(self.start).take(self.length) {
            let reg = reg.as_f64().unwrap_or(0.0) as i64;
            match self.order {
                0 => {
                    Self::push_bytes(&mut out, reg, false);
                    if self.legacy {
                        Self::push_bytes(&mut out, reg, true);
                    }
                }
                1 => Self::push_bytes(&mut out, reg, true),
                _ => {}
            }
        }
        out
    }
}

impl Stage for BytesToString {
    fn name(&self) -> &str {
        "BytesToString"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        match input.value() {
            None => Ok(Some(input)),
            Some(Value::Array(regs)) => {
                let text = self.decode(regs);
                Ok(Some(input.with_value(Some(Value::Str(text)))))
            }
            Some(_) => Err(unexpected_input("BytesToString", &input, "array")),
        }
    }
}

/// Dew point in degrees C from vapour pressure in kPa
#[derive(Debug)]
pub struct DewPoint;

impl DewPoint {
    pub fn dew_point(vapour_pressure: f64) -> Option<f64> {
        if vapour_pressure <= 0.0 {
            return None;
        }
        let ln_e = vapour_pressure.ln();
        let td = (116.9 + 237.3 * ln_e) / (16.78 - ln_e);
        Some((td * 100.0).round() / 100.0)
    }
}

impl Stage for DewPoint {
    fn name(&self) -> &str {
        "DewPoint"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        if !input.is_valid() {
            return Ok(Some(input));
        }
        let e = require_number("DewPoint", &input)?;
        Ok(Some(input.with_value(Self::dew_point(e).map(Value::Float))))
    }
}

// ==================== Rounding ====================

#[derive(Debug)]
pub struct RoundToInt;

impl Stage for RoundToInt {
    fn name(&self) -> &str {
        "RoundToInt"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        match input.value() {
            None => Ok(Some(input)),
            Some(v) if v.is_number() => {
                let rounded = v.as_f64().map(|f| Value::Int(f.round() as i64));
                Ok(Some(input.with_value(rounded)))
            }
            Some(_) => Ok(None),
        }
    }
}

/// Rounds to a number of decimal places (default 3); zero places gives an
/// integer
#[derive(Debug)]
pub struct NumDecimals {
    places: i32,
}

impl NumDecimals {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let places = parse_opt(init.class, init.args, 0, "decimal places")?.unwrap_or(3);
        if !(0..=15).contains(&places) {
            return Err(EngineError::stage_args(init.class, "decimal places must be 0 to 15"));
        }
        Ok(Box::new(Self { places }))
    }

    fn round(&self, v: f64) -> f64 {
        let scale = 10f64.powi(self.places);
        (v * scale).round() / scale
    }
}

impl Stage for NumDecimals {
    fn name(&self) -> &str {
        "NumDecimals"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let out = match input.value() {
            None => return Ok(Some(input)),
            Some(Value::Angle(a)) => Value::Angle(self.round(*a)),
            Some(v) if v.is_number() => {
                let r = self.round(v.as_f64().unwrap_or_default());
                if self.places == 0 {
                    Value::Int(r as i64)
                } else {
                    Value::Float(r)
                }
            }
            Some(_) => return Err(unexpected_input("NumDecimals", &input, "numeric")),
        };
        Ok(Some(input.with_value(Some(out))))
    }
}

// ==================== Strings ====================

#[derive(Debug)]
pub struct StringCase {
    upper: bool,
}

impl StringCase {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "\"upper\" or \"lower\"")?;
        let upper = match init.args[0].trim().to_ascii_lowercase().as_str() {
            "upper" => true,
            "lower" => false,
            other => {
                return Err(EngineError::stage_args(
                    init.class,
                    format!("expected \"upper\" or \"lower\", got \"{}\"", other),
                ))
            }
        };
        Ok(Box::new(Self { upper }))
    }
}

impl Stage for StringCase {
    fn name(&self) -> &str {
        "StringCase"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let text = value_or_pass!(input).to_string();
        let text = if self.upper {
            text.to_uppercase()
        } else {
            text.to_lowercase()
        };
        Ok(Some(input.with_value(Some(Value::Str(text)))))
    }
}

#[derive(Debug)]
pub struct StringTrim;

impl Stage for StringTrim {
    fn name(&self) -> &str {
        "StringTrim"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let text = value_or_pass!(input).to_string();
        Ok(Some(input.with_value(Some(Value::Str(text.trim().to_string())))))
    }
}

/// Replaces every occurrence of a target (replacement defaults to empty)
#[derive(Debug)]
pub struct StringReplace {
    target: String,
    replacement: String,
}

impl StringReplace {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "a target string")?;
        if init.args[0].is_empty() {
            return Err(EngineError::stage_args(init.class, "target must not be empty"));
        }
        Ok(Box::new(Self {
            target: init.args[0].clone(),
            replacement: init.args.get(1).cloned().unwrap_or_default(),
        }))
    }
}

impl Stage for StringReplace {
    fn name(&self) -> &str {
        "StringReplace"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let text = value_or_pass!(input).to_string();
        let text = text.replace(&self.target, &self.replacement);
        Ok(Some(input.with_value(Some(Value::Str(text)))))
    }
}

/// Characters `[start, end)`; a string too short ends the chain
#[derive(Debug)]
pub struct Substring {
    start: usize,
    end: Option<usize>,
}

impl Substring {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        let start: usize = parse_arg(init.class, init.args, 0, "start index")?;
        let end: Option<usize> = parse_opt(init.class, init.args, 1, "end index")?;
        if end.is_some_and(|e| e < start) {
            return Err(EngineError::stage_args(init.class, "end index before start index"));
        }
        Ok(Box::new(Self { start, end }))
    }
}

impl Stage for Substring {
    fn name(&self) -> &str {
        "Substring"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        let text = value_or_pass!(input).to_string();
        let len = text.chars().count();
        if len < self.start || self.end.is_some_and(|e| len < e) {
            return Ok(None);
        }
        let take = self.end.map_or(len, |e| e) - self.start;
        let out: String = text.chars().skip(self.start).take(take).collect();
        Ok(Some(input.with_value(Some(Value::Str(out)))))
    }
}

// ==================== Flow ====================

/// Ends the chain when there is no value
#[derive(Debug)]
pub struct StopIfNull;

impl Stage for StopIfNull {
    fn name(&self) -> &str {
        "StopIfNull"
    }

    fn translate(&mut self, input: Sample, _ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        Ok(input.is_valid().then_some(input))
    }
}

/// Takes its timestamp from the latest sample of another point
#[derive(Debug)]
pub struct CopyTimestamp {
    from: String,
}

impl CopyTimestamp {
    fn create(init: &StageInit<'_>) -> Result<Box<dyn Stage>> {
        require_args(init.class, init.args, 1, "a point name")?;
        Ok(Box::new(Self {
            from: replace_tok(&init.args[0], &init.point.source),
        }))
    }
}

impl Stage for CopyTimestamp {
    fn name(&self) -> &str {
        "CopyTimestamp"
    }

    fn translate(&mut self, input: Sample, ctx: &StageContext<'_>) -> Result<Option<Sample>> {
        Ok(ctx
            .engine
            .latest(&self.from)
            .map(|latest| input.with_timestamp(latest.timestamp())))
    }
}
