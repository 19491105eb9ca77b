//! Rhai engine setup and evaluation
//!
//! The engine is configured once with safety limits and the helper function
//! set; stages share it through the [`crate::engine::Engine`] context.

use crate::error::{EngineError, Result, ResultExt};
use crate::scripting::{CompiledExpression, ExpressionCache, SharedExpressionCache};
use rhai::{Dynamic, Engine, Scope};
use std::sync::{Arc, RwLock};

/// Expression evaluator shared by every expression stage
pub struct ScriptEngine {
    engine: Engine,
    cache: SharedExpressionCache,
}

impl ScriptEngine {
    /// Create a new script engine with default configuration
    pub fn new() -> Self {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine);

        Self {
            engine,
            cache: Arc::new(RwLock::new(ExpressionCache::new())),
        }
    }

    fn configure_engine(engine: &mut Engine) {
        // Set safety limits
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(10_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(1_000);
        engine.set_max_map_size(1_000);

        // Math
        engine.register_fn("abs", |x: f64| x.abs());
        engine.register_fn("sqrt", |x: f64| x.sqrt());
        engine.register_fn("pow", |x: f64, y: f64| x.powf(y));
        engine.register_fn("exp", |x: f64| x.exp());
        engine.register_fn("ln", |x: f64| x.ln());
        engine.register_fn("log10", |x: f64| x.log10());
        engine.register_fn("sin", |x: f64| x.sin());
        engine.register_fn("cos", |x: f64| x.cos());
        engine.register_fn("tan", |x: f64| x.tan());
        engine.register_fn("asin", |x: f64| x.asin());
        engine.register_fn("acos", |x: f64| x.acos());
        engine.register_fn("atan", |x: f64| x.atan());
        engine.register_fn("atan2", |y: f64, x: f64| y.atan2(x));
        engine.register_fn("hypot", |x: f64, y: f64| x.hypot(y));
        engine.register_fn("sinh", |x: f64| x.sinh());
        engine.register_fn("cosh", |x: f64| x.cosh());
        engine.register_fn("tanh", |x: f64| x.tanh());
        engine.register_fn("deg", |x: f64| x.to_degrees());
        engine.register_fn("rad", |x: f64| x.to_radians());

        // Rounding
        engine.register_fn("floor", |x: f64| x.floor());
        engine.register_fn("ceil", |x: f64| x.ceil());
        engine.register_fn("round", |x: f64| x.round());
        engine.register_fn("trunc", |x: f64| x.trunc());

        // Comparison
        engine.register_fn("clamp", |x: f64, min: f64, max: f64| x.clamp(min, max));
        engine.register_fn("min", |a: f64, b: f64| a.min(b));
        engine.register_fn("max", |a: f64, b: f64| a.max(b));
        engine.register_fn("sign", |x: f64| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        });

        // Bits, for status words
        engine.register_fn("bit_and", |a: i64, b: i64| a & b);
        engine.register_fn("bit_or", |a: i64, b: i64| a | b);
        engine.register_fn("bit_xor", |a: i64, b: i64| a ^ b);
        engine.register_fn("bit_shl", |a: i64, b: i64| a.wrapping_shl(b as u32));
        engine.register_fn("bit_shr", |a: i64, b: i64| a.wrapping_shr(b as u32));
        engine.register_fn("to_int", |x: f64| x as i64);
        engine.register_fn("to_float", |x: i64| x as f64);

        engine.register_fn("pi", || std::f64::consts::PI);
        engine.register_fn("e", || std::f64::consts::E);

        engine.register_fn("deadband", |value: f64, center: f64, width: f64| -> f64 {
            if (value - center).abs() <= width / 2.0 {
                center
            } else {
                value
            }
        });
        engine.register_fn(
            "map_range",
            |v: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64| -> f64 {
                if (in_hi - in_lo).abs() < f64::EPSILON {
                    out_lo
                } else {
                    out_lo + (v - in_lo) * (out_hi - out_lo) / (in_hi - in_lo)
                }
            },
        );
    }

    /// Compile an expression and cache it
    pub fn compile(&self, name: &str, source: &str) -> Result<CompiledExpression> {
        let mut cache = self
            .cache
            .write()
            .map_err(|e| EngineError::Script(format!("Failed to acquire cache lock: {}", e)))?;

        cache.get_or_compile(&self.engine, name, source)
    }

    /// Evaluate with the given numeric variables bound
    pub fn evaluate(&self, expr: &CompiledExpression, vars: &[(&str, f64)]) -> Result<f64> {
        let mut scope = Scope::new();
        for (name, value) in vars {
            scope.push(name.to_string(), *value);
        }

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, expr.ast())
            .with_context(|| format!("Execution error in {}", expr.name()))?;

        dynamic_to_f64(&result).ok_or_else(|| {
            EngineError::Script(format!(
                "Expression {} must return a number, got {}",
                expr.name(),
                result.type_name()
            ))
        })
    }

    /// Compile and evaluate in one step
    pub fn eval(&self, source: &str, vars: &[(&str, f64)]) -> Result<f64> {
        let expr = self.compile("eval", source)?;
        self.evaluate(&expr, vars)
    }

    /// Check that an expression compiles
    pub fn validate(&self, source: &str) -> Result<()> {
        self.engine
            .compile_expression(source)
            .map(|_| ())
            .map_err(|e| EngineError::Script(format!("Validation error: {}", e)))
    }

    /// Number of distinct compiled expressions
    pub fn cached(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

fn dynamic_to_f64(value: &Dynamic) -> Option<f64> {
    if let Ok(f) = value.as_float() {
        Some(f)
    } else if let Ok(i) = value.as_int() {
        Some(i as f64)
    } else if let Ok(b) = value.as_bool() {
        Some(if b { 1.0 } else { 0.0 })
    } else {
        None
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("cached", &self.cached())
            .finish()
    }
}
