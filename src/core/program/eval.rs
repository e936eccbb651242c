use serde_json::{Map, Number};
use std::cmp::Ordering;
use thiserror::Error;

use super::{Expr, Program};
use crate::core::shape::{describe, TYPE_TAG};
use crate::core::LambdaValue;

/// A fault raised while evaluating a program.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("'{op}' expected {expected}, found {found}")]
    Type {
        op: String,
        expected: String,
        found: String,
    },

    #[error("index {index} out of bounds for length {len}")]
    Index { index: i64, len: usize },

    #[error("key '{0}' not found")]
    MissingKey(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("number out of range in '{0}'")]
    Overflow(String),

    #[error("cannot read '{path}': {message}")]
    Io { path: String, message: String },

    #[error("evaluation step budget of {0} exhausted")]
    FuelExhausted(u64),

    #[error("value nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("program raised: {0}")]
    Raised(String),

    #[error("called with {found} argument(s), expected {expected}")]
    Arity { expected: usize, found: usize },

    #[error("unbound variable '{0}'")]
    Unbound(String),
}

/// Longest list `range` may build.
const MAX_RANGE: i64 = 10_000_000;

/// Deepest value a program may build.
pub(crate) const MAX_DEPTH: usize = 256;

/// String bytes covered by one unit of fuel.
const BYTES_PER_STEP: usize = 16;

/// `(min, max)` argument counts of every builtin; `None` for unknown operations.
pub(super) fn builtin_arity(op: &str) -> Option<(usize, Option<usize>)> {
    let arity = match op {
        "flatten" | "sort" | "reverse" | "unique" | "len" | "first" | "last" | "sum" | "min"
        | "max" | "keys" | "values" | "not" | "is_null" | "neg" | "to_str" | "to_int"
        | "to_float" | "trim" | "lower" | "upper" | "lines" | "read_file" | "read_csv"
        | "parse_csv" | "fail" => (1, Some(1)),
        "sort_by" | "map" | "filter" | "any" | "all" | "find" | "index_of" | "contains"
        | "append" | "eq" | "ne" | "lt" | "le" | "gt" | "ge" | "sub" | "div" | "mod"
        | "split" | "join" | "starts_with" | "ends_with" => (2, Some(2)),
        "get" | "slice" => (2, Some(3)),
        "range" => (1, Some(2)),
        "fold" | "replace" => (3, Some(3)),
        "concat" | "zip" | "merge" | "and" | "or" | "coalesce" | "add" | "mul" => (1, None),
        _ => return None,
    };
    Some(arity)
}

/// Argument position that must hold a lambda, for higher-order builtins.
pub(super) fn lambda_slot(op: &str) -> Option<usize> {
    match op {
        "sort_by" | "map" | "filter" | "any" | "all" | "find" => Some(1),
        "fold" => Some(2),
        _ => None,
    }
}

pub(super) fn run(program: &Program, args: &[LambdaValue], fuel: u64) -> Result<LambdaValue, RuntimeError> {
    let mut interpreter = Interpreter {
        remaining: fuel,
        budget: fuel,
        env: program
            .params
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect(),
    };
    interpreter.eval(&program.body)
}

struct Interpreter {
    remaining: u64,
    budget: u64,
    env: Vec<(String, LambdaValue)>,
}

impl Interpreter {
    fn tick(&mut self) -> Result<(), RuntimeError> {
        self.spend(1)
    }

    fn spend(&mut self, steps: u64) -> Result<(), RuntimeError> {
        match self.remaining.checked_sub(steps) {
            Some(left) => {
                self.remaining = left;
                Ok(())
            }
            None => {
                self.remaining = 0;
                Err(RuntimeError::FuelExhausted(self.budget))
            }
        }
    }

    /// Charges for every element of a freshly produced value and bounds its depth.
    fn account(&mut self, value: &LambdaValue) -> Result<(), RuntimeError> {
        let size = measure(value)?;
        self.spend(size.saturating_sub(1))
    }

    fn lookup(&self, name: &str) -> Result<LambdaValue, RuntimeError> {
        self.env
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| RuntimeError::Unbound(name.to_string()))
    }

    fn eval(&mut self, expr: &Expr) -> Result<LambdaValue, RuntimeError> {
        self.tick()?;
        let value = self.eval_expr(expr)?;
        self.account(&value)?;
        Ok(value)
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<LambdaValue, RuntimeError> {
        match expr {
            Expr::Lit(value) => Ok(value.clone()),
            Expr::Var(name) => self.lookup(name),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(LambdaValue::Array(out))
            }
            Expr::Object(fields) => Ok(LambdaValue::Object(self.eval_fields(fields)?)),
            Expr::New { type_name, fields } => {
                let mut map = Map::new();
                map.insert(TYPE_TAG.to_string(), LambdaValue::String(type_name.clone()));
                map.extend(self.eval_fields(fields)?);
                Ok(LambdaValue::Object(map))
            }
            Expr::Call { op, args } => self.call(op, args),
            Expr::Lambda { .. } => Err(RuntimeError::Raised(
                "a lambda cannot be used as a value".to_string(),
            )),
            Expr::Let { bindings, body } => {
                let depth = self.env.len();
                for (name, value) in bindings {
                    let value = self.eval(value)?;
                    self.env.push((name.clone(), value));
                }
                let result = self.eval(body);
                self.env.truncate(depth);
                result
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                if truthy(&self.eval(cond)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    fn eval_fields(&mut self, fields: &[(String, Expr)]) -> Result<Map<String, LambdaValue>, RuntimeError> {
        let mut map = Map::new();
        for (key, expr) in fields {
            map.insert(key.clone(), self.eval(expr)?);
        }
        Ok(map)
    }

    fn apply(&mut self, lambda: &Expr, args: Vec<LambdaValue>) -> Result<LambdaValue, RuntimeError> {
        let Expr::Lambda { params, body } = lambda else {
            return Err(RuntimeError::Raised("expected a lambda".to_string()));
        };
        if params.len() != args.len() {
            return Err(RuntimeError::Arity {
                expected: params.len(),
                found: args.len(),
            });
        }
        let depth = self.env.len();
        self.env.extend(params.iter().cloned().zip(args));
        let result = self.eval(body);
        self.env.truncate(depth);
        result
    }

    fn eval_list(&mut self, op: &str, expr: &Expr) -> Result<Vec<LambdaValue>, RuntimeError> {
        match self.eval(expr)? {
            LambdaValue::Array(items) => Ok(items),
            other => Err(type_error(op, "a list", &other)),
        }
    }

    fn call(&mut self, op: &str, args: &[Expr]) -> Result<LambdaValue, RuntimeError> {
        match op {
            "map" => {
                let items = self.eval_list(op, &args[0])?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.apply(&args[1], vec![item])?);
                }
                Ok(LambdaValue::Array(out))
            }
            "filter" => {
                let items = self.eval_list(op, &args[0])?;
                let mut out = Vec::new();
                for item in items {
                    if truthy(&self.apply(&args[1], vec![item.clone()])?) {
                        out.push(item);
                    }
                }
                Ok(LambdaValue::Array(out))
            }
            "find" => {
                for item in self.eval_list(op, &args[0])? {
                    if truthy(&self.apply(&args[1], vec![item.clone()])?) {
                        return Ok(item);
                    }
                }
                Ok(LambdaValue::Null)
            }
            "any" | "all" => {
                let want = op == "any";
                for item in self.eval_list(op, &args[0])? {
                    if truthy(&self.apply(&args[1], vec![item])?) == want {
                        return Ok(LambdaValue::Bool(want));
                    }
                }
                Ok(LambdaValue::Bool(!want))
            }
            "sort_by" => {
                let items = self.eval_list(op, &args[0])?;
                let mut keyed = Vec::with_capacity(items.len());
                for item in items {
                    keyed.push((self.apply(&args[1], vec![item.clone()])?, item));
                }
                keyed.sort_by(|a, b| compare(&a.0, &b.0));
                Ok(LambdaValue::Array(keyed.into_iter().map(|(_, v)| v).collect()))
            }
            "fold" => {
                let items = self.eval_list(op, &args[0])?;
                let mut acc = self.eval(&args[1])?;
                for item in items {
                    acc = self.apply(&args[2], vec![acc, item])?;
                }
                Ok(acc)
            }
            "and" => {
                let mut last = LambdaValue::Bool(true);
                for arg in args {
                    last = self.eval(arg)?;
                    if !truthy(&last) {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            "or" => {
                let mut last = LambdaValue::Bool(false);
                for arg in args {
                    last = self.eval(arg)?;
                    if truthy(&last) {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            "coalesce" => {
                for arg in args {
                    let value = self.eval(arg)?;
                    if !value.is_null() {
                        return Ok(value);
                    }
                }
                Ok(LambdaValue::Null)
            }
            _ => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.spend(output_bound(op, &values))?;
                builtin(op, values)
            }
        }
    }
}

/// Size of `value` in fuel units, walked without recursion.
fn measure(value: &LambdaValue) -> Result<u64, RuntimeError> {
    let mut size: u64 = 0;
    let mut pending = vec![(value, 1usize)];
    while let Some((value, depth)) = pending.pop() {
        if depth > MAX_DEPTH {
            return Err(RuntimeError::TooDeep(MAX_DEPTH));
        }
        size = size.saturating_add(1);
        match value {
            LambdaValue::String(s) => size = size.saturating_add((s.len() / BYTES_PER_STEP) as u64),
            LambdaValue::Array(items) => pending.extend(items.iter().map(|v| (v, depth + 1))),
            LambdaValue::Object(map) => pending.extend(map.values().map(|v| (v, depth + 1))),
            _ => {}
        }
    }
    Ok(size)
}

/// Upper bound on what a builtin is about to allocate, charged before it runs.
fn output_bound(op: &str, args: &[LambdaValue]) -> u64 {
    let text_len = |v: &LambdaValue| v.as_str().map_or(0, str::len);
    let list_len = |v: &LambdaValue| v.as_array().map_or(0, Vec::len);
    let elements = match op {
        "range" => {
            let bounds = match (args.first().and_then(|a| a.as_i64()), args.get(1).and_then(|a| a.as_i64())) {
                (Some(start), Some(end)) => end.saturating_sub(start),
                (Some(end), None) => end,
                _ => 0,
            };
            usize::try_from(bounds.max(0)).unwrap_or(usize::MAX)
        }
        "concat" => args
            .iter()
            .map(|a| list_len(a).saturating_add(text_len(a) / BYTES_PER_STEP))
            .fold(0usize, usize::saturating_add),
        "flatten" => args
            .first()
            .and_then(|a| a.as_array())
            .map_or(0, |items| items.iter().map(|i| list_len(i).max(1)).fold(0, usize::saturating_add)),
        "zip" => args
            .iter()
            .map(list_len)
            .min()
            .unwrap_or(0)
            .saturating_mul(args.len()),
        "replace" => {
            let (s, from, to) = (
                args.first().map_or(0, text_len),
                args.get(1).map_or(0, text_len),
                args.get(2).map_or(0, text_len),
            );
            let hits = s / from.max(1) + 1;
            hits.saturating_mul(to).saturating_add(s) / BYTES_PER_STEP
        }
        _ => 0,
    };
    elements as u64
}

fn type_error(op: &str, expected: &str, found: &LambdaValue) -> RuntimeError {
    RuntimeError::Type {
        op: op.to_string(),
        expected: expected.to_string(),
        found: describe(found),
    }
}

fn truthy(value: &LambdaValue) -> bool {
    match value {
        LambdaValue::Null => false,
        LambdaValue::Bool(b) => *b,
        LambdaValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        LambdaValue::String(s) => !s.is_empty(),
        LambdaValue::Array(items) => !items.is_empty(),
        LambdaValue::Object(map) => !map.is_empty(),
    }
}

fn rank(value: &LambdaValue) -> u8 {
    match value {
        LambdaValue::Null => 0,
        LambdaValue::Bool(_) => 1,
        LambdaValue::Number(_) => 2,
        LambdaValue::String(_) => 3,
        LambdaValue::Array(_) => 4,
        LambdaValue::Object(_) => 5,
    }
}

/// Total order over values: by kind first, then by content.
fn compare(a: &LambdaValue, b: &LambdaValue) -> Ordering {
    match (a, b) {
        (LambdaValue::Bool(x), LambdaValue::Bool(y)) => x.cmp(y),
        (LambdaValue::Number(x), LambdaValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&y.as_f64().unwrap_or(0.0))
                .unwrap_or(Ordering::Equal),
        },
        (LambdaValue::String(x), LambdaValue::String(y)) => x.cmp(y),
        (LambdaValue::Array(x), LambdaValue::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (LambdaValue::Object(x), LambdaValue::Object(y)) => {
            let mut xs: Vec<_> = x.iter().collect();
            let mut ys: Vec<_> = y.iter().collect();
            xs.sort_by(|l, r| l.0.cmp(r.0));
            ys.sort_by(|l, r| l.0.cmp(r.0));
            for ((lk, lv), (rk, rv)) in xs.iter().zip(&ys) {
                let ord = lk.cmp(rk).then_with(|| compare(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(&self) -> f64 {
        match self {
            Num::Int(i) => *i as f64,
            Num::Float(f) => *f,
        }
    }
}

fn num(op: &str, value: &LambdaValue) -> Result<Num, RuntimeError> {
    match value {
        LambdaValue::Number(n) => match n.as_i64() {
            Some(i) => Ok(Num::Int(i)),
            None => Ok(Num::Float(n.as_f64().unwrap_or(0.0))),
        },
        other => Err(type_error(op, "a number", other)),
    }
}

fn float(op: &str, f: f64) -> Result<LambdaValue, RuntimeError> {
    Number::from_f64(f)
        .map(LambdaValue::Number)
        .ok_or_else(|| RuntimeError::Overflow(op.to_string()))
}

fn arith(op: &str, a: Num, b: Num) -> Result<Num, RuntimeError> {
    let overflow = || RuntimeError::Overflow(op.to_string());
    Ok(match (op, a, b) {
        ("add", Num::Int(x), Num::Int(y)) => Num::Int(x.checked_add(y).ok_or_else(overflow)?),
        ("sub", Num::Int(x), Num::Int(y)) => Num::Int(x.checked_sub(y).ok_or_else(overflow)?),
        ("mul", Num::Int(x), Num::Int(y)) => Num::Int(x.checked_mul(y).ok_or_else(overflow)?),
        ("mod", Num::Int(_), Num::Int(0)) => return Err(RuntimeError::DivisionByZero),
        ("mod", Num::Int(x), Num::Int(y)) => Num::Int(x.checked_rem_euclid(y).ok_or_else(overflow)?),
        ("add", x, y) => Num::Float(x.as_f64() + y.as_f64()),
        ("sub", x, y) => Num::Float(x.as_f64() - y.as_f64()),
        ("mul", x, y) => Num::Float(x.as_f64() * y.as_f64()),
        ("mod", x, y) => {
            if y.as_f64() == 0.0 {
                return Err(RuntimeError::DivisionByZero);
            }
            Num::Float(x.as_f64().rem_euclid(y.as_f64()))
        }
        (_, x, y) => {
            if y.as_f64() == 0.0 {
                return Err(RuntimeError::DivisionByZero);
            }
            Num::Float(x.as_f64() / y.as_f64())
        }
    })
}

fn num_value(op: &str, n: Num) -> Result<LambdaValue, RuntimeError> {
    match n {
        Num::Int(i) => Ok(LambdaValue::from(i)),
        Num::Float(f) => float(op, f),
    }
}

fn list<'a>(op: &str, value: &'a LambdaValue) -> Result<&'a Vec<LambdaValue>, RuntimeError> {
    value.as_array().ok_or_else(|| type_error(op, "a list", value))
}

fn text<'a>(op: &str, value: &'a LambdaValue) -> Result<&'a str, RuntimeError> {
    value.as_str().ok_or_else(|| type_error(op, "a str", value))
}

fn int(op: &str, value: &LambdaValue) -> Result<i64, RuntimeError> {
    value.as_i64().ok_or_else(|| type_error(op, "an int", value))
}

fn to_text(value: &LambdaValue) -> String {
    match value {
        LambdaValue::Null => String::new(),
        LambdaValue::String(s) => s.clone(),
        LambdaValue::Bool(b) => b.to_string(),
        LambdaValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Resolves a possibly negative index against `len`.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let resolved = if index < 0 { len as i64 + index } else { index };
    (0..len as i64).contains(&resolved).then_some(resolved as usize)
}

fn clamp_bound(index: i64, len: usize) -> usize {
    let resolved = if index < 0 { len as i64 + index } else { index };
    resolved.clamp(0, len as i64) as usize
}

fn read_text(path: &LambdaValue) -> Result<String, RuntimeError> {
    let path = text("read_file", path)?;
    std::fs::read_to_string(path).map_err(|e| RuntimeError::Io {
        path: path.to_string(),
        message: e.to_string(),
    })
}

/// Splits CSV text into rows of fields, honouring double-quoted fields.
pub(crate) fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows.retain(|r| !(r.len() == 1 && r[0].is_empty()));
    rows
}

fn csv_value(text: &str) -> LambdaValue {
    LambdaValue::Array(
        parse_csv(text)
            .into_iter()
            .map(|row| LambdaValue::Array(row.into_iter().map(LambdaValue::String).collect()))
            .collect(),
    )
}

fn builtin(op: &str, args: Vec<LambdaValue>) -> Result<LambdaValue, RuntimeError> {
    let arg = |i: usize| &args[i];
    let value = match op {
        "concat" => {
            if args.iter().all(|a| a.is_string()) {
                LambdaValue::String(args.iter().filter_map(|a| a.as_str()).collect())
            } else {
                let mut out = Vec::new();
                for a in &args {
                    out.extend(list(op, a)?.iter().cloned());
                }
                LambdaValue::Array(out)
            }
        }
        "flatten" => {
            let mut out = Vec::new();
            for item in list(op, arg(0))? {
                match item {
                    LambdaValue::Array(inner) => out.extend(inner.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            LambdaValue::Array(out)
        }
        "sort" => {
            let mut items = list(op, arg(0))?.clone();
            items.sort_by(compare);
            LambdaValue::Array(items)
        }
        "reverse" => match arg(0) {
            LambdaValue::String(s) => LambdaValue::String(s.chars().rev().collect()),
            other => LambdaValue::Array(list(op, other)?.iter().rev().cloned().collect()),
        },
        "unique" => {
            let mut out: Vec<LambdaValue> = Vec::new();
            for item in list(op, arg(0))? {
                if !out.iter().any(|o| compare(o, item) == Ordering::Equal) {
                    out.push(item.clone());
                }
            }
            LambdaValue::Array(out)
        }
        "len" => match arg(0) {
            LambdaValue::Array(items) => LambdaValue::from(items.len()),
            LambdaValue::String(s) => LambdaValue::from(s.chars().count()),
            LambdaValue::Object(map) => LambdaValue::from(map.len()),
            other => return Err(type_error(op, "a list, str or dict", other)),
        },
        "get" => {
            let found = match (arg(0), arg(1)) {
                (LambdaValue::Array(items), LambdaValue::Number(_)) => {
                    let index = int(op, arg(1))?;
                    match resolve_index(index, items.len()) {
                        Some(i) => Ok(items[i].clone()),
                        None => Err(RuntimeError::Index {
                            index,
                            len: items.len(),
                        }),
                    }
                }
                (LambdaValue::String(s), LambdaValue::Number(_)) => {
                    let index = int(op, arg(1))?;
                    let chars: Vec<char> = s.chars().collect();
                    match resolve_index(index, chars.len()) {
                        Some(i) => Ok(LambdaValue::String(chars[i].to_string())),
                        None => Err(RuntimeError::Index {
                            index,
                            len: chars.len(),
                        }),
                    }
                }
                (LambdaValue::Object(map), LambdaValue::String(key)) => map
                    .get(key)
                    .cloned()
                    .ok_or_else(|| RuntimeError::MissingKey(key.clone())),
                (container, _) => return Err(type_error(op, "a list, str or dict with a matching key", container)),
            };
            match (found, args.get(2)) {
                (Ok(v), _) => v,
                (Err(_), Some(default)) => default.clone(),
                (Err(e), None) => return Err(e),
            }
        }
        "slice" => {
            let start = int(op, arg(1))?;
            match arg(0) {
                LambdaValue::String(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let end = match args.get(2) {
                        Some(e) => int(op, e)?,
                        None => chars.len() as i64,
                    };
                    let (a, b) = (clamp_bound(start, chars.len()), clamp_bound(end, chars.len()));
                    LambdaValue::String(if a < b { chars[a..b].iter().collect() } else { String::new() })
                }
                other => {
                    let items = list(op, other)?;
                    let end = match args.get(2) {
                        Some(e) => int(op, e)?,
                        None => items.len() as i64,
                    };
                    let (a, b) = (clamp_bound(start, items.len()), clamp_bound(end, items.len()));
                    LambdaValue::Array(if a < b { items[a..b].to_vec() } else { Vec::new() })
                }
            }
        }
        "zip" => {
            let lists = args.iter().map(|a| list(op, a)).collect::<Result<Vec<_>, _>>()?;
            let len = lists.iter().map(|l| l.len()).min().unwrap_or(0);
            LambdaValue::Array(
                (0..len)
                    .map(|i| LambdaValue::Array(lists.iter().map(|l| l[i].clone()).collect()))
                    .collect(),
            )
        }
        "range" => {
            let (start, end) = match args.get(1) {
                Some(end) => (int(op, arg(0))?, int(op, end)?),
                None => (0, int(op, arg(0))?),
            };
            if end.saturating_sub(start) > MAX_RANGE {
                return Err(RuntimeError::Overflow(op.to_string()));
            }
            LambdaValue::Array((start..end).map(LambdaValue::from).collect())
        }
        "index_of" => {
            let items = list(op, arg(0))?;
            let position = items.iter().position(|i| compare(i, arg(1)) == Ordering::Equal);
            LambdaValue::from(position.map(|p| p as i64).unwrap_or(-1))
        }
        "contains" => LambdaValue::Bool(match (arg(0), arg(1)) {
            (LambdaValue::Array(items), needle) => {
                items.iter().any(|i| compare(i, needle) == Ordering::Equal)
            }
            (LambdaValue::String(s), LambdaValue::String(needle)) => s.contains(needle.as_str()),
            (LambdaValue::Object(map), LambdaValue::String(key)) => map.contains_key(key),
            (container, _) => return Err(type_error(op, "a list, str or dict", container)),
        }),
        "first" => list(op, arg(0))?.first().cloned().unwrap_or(LambdaValue::Null),
        "last" => list(op, arg(0))?.last().cloned().unwrap_or(LambdaValue::Null),
        "append" => {
            let mut items = list(op, arg(0))?.clone();
            items.push(arg(1).clone());
            LambdaValue::Array(items)
        }
        "sum" => {
            let mut total = Num::Int(0);
            for item in list(op, arg(0))? {
                total = arith("add", total, num(op, item)?)?;
            }
            num_value(op, total)?
        }
        "min" | "max" => {
            let items = list(op, arg(0))?;
            let pick = if op == "min" {
                items.iter().min_by(|a, b| compare(a, b))
            } else {
                items.iter().max_by(|a, b| compare(a, b))
            };
            pick.cloned().unwrap_or(LambdaValue::Null)
        }
        "keys" | "values" => {
            let map = arg(0).as_object().ok_or_else(|| type_error(op, "a dict", arg(0)))?;
            let entries = map.iter().filter(|(k, _)| k.as_str() != TYPE_TAG);
            LambdaValue::Array(if op == "keys" {
                entries.map(|(k, _)| LambdaValue::String(k.clone())).collect()
            } else {
                entries.map(|(_, v)| v.clone()).collect()
            })
        }
        "merge" => {
            let mut out = Map::new();
            for a in &args {
                let map = a.as_object().ok_or_else(|| type_error(op, "a dict", a))?;
                out.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            LambdaValue::Object(out)
        }
        "eq" => LambdaValue::Bool(compare(arg(0), arg(1)) == Ordering::Equal),
        "ne" => LambdaValue::Bool(compare(arg(0), arg(1)) != Ordering::Equal),
        "lt" => LambdaValue::Bool(compare(arg(0), arg(1)) == Ordering::Less),
        "le" => LambdaValue::Bool(compare(arg(0), arg(1)) != Ordering::Greater),
        "gt" => LambdaValue::Bool(compare(arg(0), arg(1)) == Ordering::Greater),
        "ge" => LambdaValue::Bool(compare(arg(0), arg(1)) != Ordering::Less),
        "not" => LambdaValue::Bool(!truthy(arg(0))),
        "is_null" => LambdaValue::Bool(arg(0).is_null()),
        "add" | "mul" => {
            let mut acc = num(op, arg(0))?;
            for a in &args[1..] {
                acc = arith(op, acc, num(op, a)?)?;
            }
            num_value(op, acc)?
        }
        "sub" | "div" | "mod" => num_value(op, arith(op, num(op, arg(0))?, num(op, arg(1))?)?)?,
        "neg" => match num(op, arg(0))? {
            Num::Int(i) => LambdaValue::from(i.checked_neg().ok_or_else(|| RuntimeError::Overflow(op.into()))?),
            Num::Float(f) => float(op, -f)?,
        },
        "to_str" => LambdaValue::String(to_text(arg(0))),
        "to_int" => match arg(0) {
            LambdaValue::Number(n) => match n.as_i64() {
                Some(i) => LambdaValue::from(i),
                None => LambdaValue::from(n.as_f64().unwrap_or(0.0).trunc() as i64),
            },
            LambdaValue::Bool(b) => LambdaValue::from(*b as i64),
            LambdaValue::String(s) => {
                let trimmed = s.trim();
                match trimmed.parse::<i64>() {
                    Ok(i) => LambdaValue::from(i),
                    Err(_) => match trimmed.parse::<f64>() {
                        Ok(f) if f.is_finite() => LambdaValue::from(f.trunc() as i64),
                        _ => return Err(type_error(op, "an integer literal", arg(0))),
                    },
                }
            }
            other => return Err(type_error(op, "a number, bool or str", other)),
        },
        "to_float" => match arg(0) {
            LambdaValue::Number(n) => float(op, n.as_f64().unwrap_or(0.0))?,
            LambdaValue::String(s) => match s.trim().parse::<f64>() {
                Ok(f) => float(op, f)?,
                Err(_) => return Err(type_error(op, "a numeric literal", arg(0))),
            },
            other => return Err(type_error(op, "a number or str", other)),
        },
        "split" => {
            let s = text(op, arg(0))?;
            let sep = text(op, arg(1))?;
            let parts: Vec<LambdaValue> = if sep.is_empty() {
                s.chars().map(|c| LambdaValue::String(c.to_string())).collect()
            } else {
                s.split(sep).map(|p| LambdaValue::String(p.to_string())).collect()
            };
            LambdaValue::Array(parts)
        }
        "join" => {
            let sep = text(op, arg(1))?;
            let parts: Vec<String> = list(op, arg(0))?.iter().map(to_text).collect();
            LambdaValue::String(parts.join(sep))
        }
        "trim" => LambdaValue::String(text(op, arg(0))?.trim().to_string()),
        "lower" => LambdaValue::String(text(op, arg(0))?.to_lowercase()),
        "upper" => LambdaValue::String(text(op, arg(0))?.to_uppercase()),
        "lines" => LambdaValue::Array(
            text(op, arg(0))?
                .lines()
                .map(|l| LambdaValue::String(l.to_string()))
                .collect(),
        ),
        "replace" => LambdaValue::String(text(op, arg(0))?.replace(text(op, arg(1))?, text(op, arg(2))?)),
        "starts_with" => LambdaValue::Bool(text(op, arg(0))?.starts_with(text(op, arg(1))?)),
        "ends_with" => LambdaValue::Bool(text(op, arg(0))?.ends_with(text(op, arg(1))?)),
        "read_file" => LambdaValue::String(read_text(arg(0))?),
        "read_csv" => csv_value(&read_text(arg(0))?),
        "parse_csv" => csv_value(text(op, arg(0))?),
        "fail" => return Err(RuntimeError::Raised(to_text(arg(0)))),
        _ => {
            return Err(RuntimeError::Raised(format!("unknown operation '{}'", op)));
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::program::Callable;
    use serde_json::json;
    use std::io::Write;

    fn eval_body(params: &[&str], body: LambdaValue, args: &[LambdaValue]) -> Result<LambdaValue, RuntimeError> {
        let source = json!({"params": params, "body": body}).to_string();
        let callable = Callable::load(&source, params.len(), 100_000).unwrap();
        callable.call(args)
    }

    #[test]
    fn test_list_ops() {
        let out = eval_body(
            &["xs"],
            json!({"op": "unique", "args": [{"op": "sort", "args": [{"var": "xs"}]}]}),
            &[json!([3, 1, 2, 3, 1])],
        )
        .unwrap();
        assert_eq!(out, json!([1, 2, 3]));

        let out = eval_body(&["xs"], json!({"op": "slice", "args": [{"var": "xs"}, 1, -1]}), &[json!([1, 2, 3, 4])]).unwrap();
        assert_eq!(out, json!([2, 3]));

        let out = eval_body(&["xs"], json!({"op": "get", "args": [{"var": "xs"}, -1]}), &[json!(["a", "b"])]).unwrap();
        assert_eq!(out, json!("b"));
    }

    #[test]
    fn test_get_out_of_bounds_and_default() {
        let err = eval_body(&["xs"], json!({"op": "get", "args": [{"var": "xs"}, 5]}), &[json!([1])]).unwrap_err();
        assert_eq!(err, RuntimeError::Index { index: 5, len: 1 });

        let out = eval_body(&["xs"], json!({"op": "get", "args": [{"var": "xs"}, 5, "none"]}), &[json!([1])]).unwrap();
        assert_eq!(out, json!("none"));
    }

    #[test]
    fn test_higher_order_ops() {
        let body = json!({"op": "map", "args": [
            {"op": "filter", "args": [{"var": "xs"}, {"fn": ["x"], "body": {"op": "gt", "args": [{"var": "x"}, 1]}}]},
            {"fn": ["x"], "body": {"op": "mul", "args": [{"var": "x"}, 10]}}
        ]});
        assert_eq!(eval_body(&["xs"], body, &[json!([1, 2, 3])]).unwrap(), json!([20, 30]));

        let body = json!({"op": "fold", "args": [{"var": "xs"}, 0, {"fn": ["acc", "x"], "body": {"op": "add", "args": [{"var": "acc"}, {"var": "x"}]}}]});
        assert_eq!(eval_body(&["xs"], body, &[json!([1, 2, 3])]).unwrap(), json!(6));

        let body = json!({"op": "sort_by", "args": [{"var": "xs"}, {"fn": ["p"], "body": {"op": "get", "args": [{"var": "p"}, "age"]}}]});
        let out = eval_body(&["xs"], body, &[json!([{"age": 30}, {"age": 20}])]).unwrap();
        assert_eq!(out, json!([{"age": 20}, {"age": 30}]));
    }

    #[test]
    fn test_let_if_and_records() {
        let body = json!({
            "let": {"row": {"var": "r"}},
            "in": {"if": {"op": "eq", "args": [{"op": "len", "args": [{"var": "row"}]}, 2]},
                   "then": {"new": "Person", "fields": {
                       "name": {"op": "get", "args": [{"var": "row"}, 0]},
                       "age": {"op": "to_int", "args": [{"op": "get", "args": [{"var": "row"}, 1]}]}
                   }},
                   "else": null}
        });
        let out = eval_body(&["r"], body, &[json!(["Ann", " 30 "])]).unwrap();
        assert_eq!(out, json!({"__type__": "Person", "name": "Ann", "age": 30}));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_body(&[], json!({"op": "div", "args": [7, 2]}), &[]).unwrap(), json!(3.5));
        assert_eq!(eval_body(&[], json!({"op": "mod", "args": [-7, 3]}), &[]).unwrap(), json!(2));
        assert_eq!(
            eval_body(&[], json!({"op": "div", "args": [1, 0]}), &[]).unwrap_err(),
            RuntimeError::DivisionByZero
        );
        assert_eq!(eval_body(&[], json!({"op": "sum", "args": [[1, 2.5]]}), &[]).unwrap(), json!(3.5));
    }

    #[test]
    fn test_type_errors_and_fail() {
        let err = eval_body(&["x"], json!({"op": "upper", "args": [{"var": "x"}]}), &[json!(3)]).unwrap_err();
        assert!(matches!(err, RuntimeError::Type { ref op, .. } if op == "upper"));

        let err = eval_body(&[], json!({"op": "fail", "args": ["bad input"]}), &[]).unwrap_err();
        assert_eq!(err, RuntimeError::Raised("bad input".into()));
    }

    #[test]
    fn test_fuel_exhaustion() {
        let source = json!({
            "params": [],
            "body": {"op": "map", "args": [{"op": "range", "args": [1000]}, {"fn": ["x"], "body": {"var": "x"}}]}
        })
        .to_string();
        let callable = Callable::load(&source, 0, 50).unwrap();
        assert_eq!(callable.call(&[]).unwrap_err(), RuntimeError::FuelExhausted(50));
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        let min = json!(i64::MIN);
        for op in ["mod", "mul"] {
            let err = eval_body(&[], json!({"op": op, "args": [min.clone(), -1]}), &[]).unwrap_err();
            assert_eq!(err, RuntimeError::Overflow(op.to_string()));
        }
        let err = eval_body(&[], json!({"op": "sub", "args": [min.clone(), 1]}), &[]).unwrap_err();
        assert_eq!(err, RuntimeError::Overflow("sub".into()));
        let err = eval_body(&["x"], json!({"op": "neg", "args": [{"var": "x"}]}), &[min]).unwrap_err();
        assert_eq!(err, RuntimeError::Overflow("neg".into()));
    }

    #[test]
    fn test_fuel_bounds_allocation() {
        // Doubles the accumulator on every step
        let source = json!({"params": [], "body": {"op": "fold", "args": [
            {"op": "range", "args": [22]},
            [1],
            {"fn": ["acc", "x"], "body": {"op": "concat", "args": [{"var": "acc"}, {"var": "acc"}]}}
        ]}})
        .to_string();
        let callable = Callable::load(&source, 0, 1000).unwrap();
        assert_eq!(callable.call(&[]).unwrap_err(), RuntimeError::FuelExhausted(1000));

        let source = json!({"params": [], "body": {"op": "range", "args": [5_000_000]}}).to_string();
        let callable = Callable::load(&source, 0, 1000).unwrap();
        assert_eq!(callable.call(&[]).unwrap_err(), RuntimeError::FuelExhausted(1000));
    }

    #[test]
    fn test_string_growth_costs_fuel() {
        let source = json!({"params": [], "body": {"op": "fold", "args": [
            {"op": "range", "args": [40]},
            "abcdefghijklmnop",
            {"fn": ["acc", "x"], "body": {"op": "replace", "args": [{"var": "acc"}, "", {"var": "acc"}]}}
        ]}})
        .to_string();
        let callable = Callable::load(&source, 0, 100_000).unwrap();
        assert_eq!(callable.call(&[]).unwrap_err(), RuntimeError::FuelExhausted(100_000));
    }

    #[test]
    fn test_nesting_depth_is_capped() {
        let source = json!({"params": [], "body": {"op": "fold", "args": [
            {"op": "range", "args": [100_000]},
            [],
            {"fn": ["acc", "x"], "body": [{"var": "acc"}]}
        ]}})
        .to_string();
        let callable = Callable::load(&source, 0, 1_000_000).unwrap();
        assert_eq!(callable.call(&[]).unwrap_err(), RuntimeError::TooDeep(MAX_DEPTH));
    }

    #[test]
    fn test_parse_csv_quotes_and_blank_lines() {
        let rows = parse_csv("\u{feff}name,note\r\n\"Ann\",\"a, \"\"quoted\"\" note\"\n\nBo,\n");
        assert_eq!(
            rows,
            vec![
                vec!["name".to_string(), "note".to_string()],
                vec!["Ann".to_string(), "a, \"quoted\" note".to_string()],
                vec!["Bo".to_string(), String::new()],
            ]
        );
    }

    #[test]
    fn test_read_csv_and_missing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "姓名,年龄,专业\n张三,20,数学\n").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let out = eval_body(&["p"], json!({"op": "read_csv", "args": [{"var": "p"}]}), &[json!(path)]).unwrap();
        assert_eq!(out, json!([["姓名", "年龄", "专业"], ["张三", "20", "数学"]]));

        let err = eval_body(&["p"], json!({"op": "read_file", "args": [{"var": "p"}]}), &[json!("/nonexistent/x.csv")]).unwrap_err();
        assert!(matches!(err, RuntimeError::Io { .. }));
    }
}
