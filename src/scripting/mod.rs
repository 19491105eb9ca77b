//! Rhai expression engine for calculation stages
//!
//! Expression stages (`EQ`, `Calculation`, `CalculationTimed`) compile their
//! expression text once at construction and evaluate it with named numeric
//! variables bound in a fresh scope on every update.
//!
//! ## Variables
//!
//! - `EQ` binds the input as `x` (and `X`)
//! - `Calculation` binds its listened-to inputs as `a`, `b`, `c`, ...
//!
//! ## Helper Functions
//!
//! Besides Rhai's own arithmetic:
//!
//! - `abs`, `sqrt`, `pow`, `exp`, `ln`, `log10`, trig and hyperbolic functions
//! - `floor`, `ceil`, `round`, `trunc`, `clamp`, `min`, `max`, `sign`
//! - `deg(rad)`, `rad(deg)`, `hypot(x, y)`, `atan2(y, x)`
//! - `bit_and`, `bit_or`, `bit_xor`, `bit_shl`, `bit_shr` on integers
//! - `deadband(value, center, width)`, `map_range(v, in_lo, in_hi, out_lo, out_hi)`
//! - `pi()`, `e()`
//!
//! ## Example Expressions
//!
//! Scaling a raw ADC count:
//! ```rhai
//! x * 3.3 / 4095.0
//! ```
//!
//! Combining two listened-to points:
//! ```rhai
//! hypot(a, b)
//! ```

mod engine;

pub use engine::ScriptEngine;

use crate::error::{EngineError, Result};
use rhai::{Engine, AST};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A compiled expression that can be evaluated repeatedly
#[derive(Clone)]
pub struct CompiledExpression {
    ast: AST,
    source: String,
    /// Usually the owning point and stage, used in error messages
    name: String,
}

impl CompiledExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }
}

impl std::fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledExpression")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

/// Cache of compiled expressions keyed by source text.
///
/// Definition files often repeat the same expression across many sources,
/// so each distinct text is compiled once.
#[derive(Default)]
pub struct ExpressionCache {
    cache: HashMap<String, CompiledExpression>,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    /// Get a cached expression or compile and cache it
    pub fn get_or_compile(
        &mut self,
        engine: &Engine,
        name: &str,
        source: &str,
    ) -> Result<CompiledExpression> {
        if let Some(expr) = self.cache.get(source) {
            return Ok(CompiledExpression {
                name: name.to_string(),
                ..expr.clone()
            });
        }

        let ast = engine
            .compile_expression(source)
            .map_err(|e| EngineError::Script(format!("Compilation error in {}: {}", name, e)))?;

        let expr = CompiledExpression {
            ast,
            source: source.to_string(),
            name: name.to_string(),
        };

        self.cache.insert(source.to_string(), expr.clone());
        Ok(expr)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Thread-safe expression cache
pub type SharedExpressionCache = Arc<RwLock<ExpressionCache>>;
