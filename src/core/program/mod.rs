//! Lambda programs: the implementations the backend synthesizes.
//!
//! A program is a JSON document
//! `{"name": "...", "params": ["a", "b"], "body": <expr>}` in a small, closed,
//! purely functional expression language. Programs are untrusted: [`Program::load`]
//! checks them statically (known operations, operation arity, scoping) and
//! [`Callable::call`] evaluates them with a step budget.

mod eval;

pub use eval::RuntimeError;

use serde_json::Map;
use std::sync::Arc;
use thiserror::Error;

use crate::core::LambdaValue;

/// Language reference handed to the backend when prompting.
pub const LANGUAGE_REFERENCE: &str = r#"Programs are JSON: {"name": str, "params": [str, ...], "body": EXPR}.
EXPR forms:
  string | number | bool | null      literal
  [EXPR, ...]                        list literal
  {"lit": any-json}                  literal (use for literal objects)
  {"var": "x"}                       parameter or bound variable
  {"op": "name", "args": [EXPR...]}  builtin call
  {"fn": ["x"], "body": EXPR}        lambda, only as the function argument of map/filter/sort_by/any/all/find/fold
  {"let": {"x": EXPR}, "in": EXPR}   local bindings (evaluated in order)
  {"if": EXPR, "then": EXPR, "else": EXPR}
  {"obj": {"key": EXPR}}             build a dict
  {"new": "TypeName", "fields": {"field": EXPR}}   build a record of a user type
Builtins:
  lists: concat flatten sort sort_by(list, fn) reverse unique len get(c, key|index[, default])
         slice(list, start[, end]) map(list, fn) filter(list, fn) fold(list, init, fn(acc, x))
         any(list, fn) all(list, fn) find(list, fn) zip range(n | start, end) index_of contains
         first last append(list, x) sum min max
  dicts: keys values merge
  logic: eq ne lt le gt ge and or not is_null coalesce
  math:  add sub mul div mod neg
  text:  to_str to_int to_float split(s, sep) join(list, sep) trim lower upper lines
         replace(s, from, to) starts_with ends_with
  io:    read_file(path) read_csv(path) parse_csv(text)   (csv -> list of rows of str)
  error: fail(message)"#;

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("program is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed program: {0}")]
    Malformed(String),

    #[error("unknown operation '{0}'")]
    UnknownOp(String),

    #[error("operation '{op}' takes {expected} argument(s), got {found}")]
    OpArity {
        op: String,
        expected: String,
        found: usize,
    },

    #[error("unbound variable '{0}'")]
    UnboundVariable(String),

    #[error("lambda used outside a higher-order operation")]
    MisplacedLambda,

    #[error("program takes {found} parameter(s) but the call binds {expected}")]
    ParamArity { expected: usize, found: usize },
}

/// Expression tree of a lambda program.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(LambdaValue),
    Var(String),
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    New {
        type_name: String,
        fields: Vec<(String, Expr)>,
    },
    Call {
        op: String,
        args: Vec<Expr>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
    Let {
        bindings: Vec<(String, Expr)>,
        body: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

/// A statically checked lambda program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub params: Vec<String>,
    pub body: Expr,
}

impl Program {
    /// Parses and checks program source.
    pub fn load(source: &str) -> Result<Self, ProgramError> {
        let doc: LambdaValue = serde_json::from_str(source)?;
        Self::from_value(&doc)
    }

    pub fn from_value(doc: &LambdaValue) -> Result<Self, ProgramError> {
        let map = doc
            .as_object()
            .ok_or_else(|| ProgramError::Malformed("program must be a JSON object".into()))?;
        let name = map
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("lambda")
            .to_string();
        let params = match map.get("params") {
            Some(p) => string_list(p, "params")?,
            None => Vec::new(),
        };
        let body = map
            .get("body")
            .ok_or_else(|| ProgramError::Malformed("program has no 'body'".into()))?;
        let body = parse_expr(body)?;

        let program = Self { name, params, body };
        let mut scope: Vec<&str> = program.params.iter().map(String::as_str).collect();
        check(&program.body, &mut scope, false)?;
        Ok(program)
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

fn string_list(value: &LambdaValue, what: &str) -> Result<Vec<String>, ProgramError> {
    value
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|i| i.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| ProgramError::Malformed(format!("'{}' must be a list of strings", what)))
}

fn field_list(value: &LambdaValue, what: &str) -> Result<Vec<(String, Expr)>, ProgramError> {
    let map: &Map<String, LambdaValue> = value
        .as_object()
        .ok_or_else(|| ProgramError::Malformed(format!("'{}' must be an object", what)))?;
    map.iter()
        .map(|(k, v)| Ok((k.clone(), parse_expr(v)?)))
        .collect()
}

fn required<'a>(
    map: &'a Map<String, LambdaValue>,
    key: &str,
    form: &str,
) -> Result<&'a LambdaValue, ProgramError> {
    map.get(key)
        .ok_or_else(|| ProgramError::Malformed(format!("'{}' form requires '{}'", form, key)))
}

fn parse_expr(value: &LambdaValue) -> Result<Expr, ProgramError> {
    let map = match value {
        LambdaValue::Array(items) => {
            return Ok(Expr::List(
                items.iter().map(parse_expr).collect::<Result<_, _>>()?,
            ));
        }
        LambdaValue::Object(map) => map,
        other => return Ok(Expr::Lit(other.clone())),
    };

    if let Some(lit) = map.get("lit") {
        return Ok(Expr::Lit(lit.clone()));
    }
    if let Some(var) = map.get("var") {
        let name = var
            .as_str()
            .ok_or_else(|| ProgramError::Malformed("'var' must be a string".into()))?;
        return Ok(Expr::Var(name.to_string()));
    }
    if let Some(op) = map.get("op") {
        let op = op
            .as_str()
            .ok_or_else(|| ProgramError::Malformed("'op' must be a string".into()))?;
        let args = match map.get("args") {
            Some(LambdaValue::Array(items)) => {
                items.iter().map(parse_expr).collect::<Result<_, _>>()?
            }
            Some(_) => return Err(ProgramError::Malformed("'args' must be a list".into())),
            None => Vec::new(),
        };
        return Ok(Expr::Call {
            op: op.to_string(),
            args,
        });
    }
    if let Some(params) = map.get("fn") {
        return Ok(Expr::Lambda {
            params: string_list(params, "fn")?,
            body: Box::new(parse_expr(required(map, "body", "fn")?)?),
        });
    }
    if let Some(bindings) = map.get("let") {
        return Ok(Expr::Let {
            bindings: field_list(bindings, "let")?,
            body: Box::new(parse_expr(required(map, "in", "let")?)?),
        });
    }
    if let Some(cond) = map.get("if") {
        return Ok(Expr::If {
            cond: Box::new(parse_expr(cond)?),
            then: Box::new(parse_expr(required(map, "then", "if")?)?),
            otherwise: Box::new(parse_expr(required(map, "else", "if")?)?),
        });
    }
    if let Some(fields) = map.get("obj") {
        return Ok(Expr::Object(field_list(fields, "obj")?));
    }
    if let Some(type_name) = map.get("new") {
        let type_name = type_name
            .as_str()
            .ok_or_else(|| ProgramError::Malformed("'new' must be a type name".into()))?;
        let fields = match map.get("fields") {
            Some(fields) => field_list(fields, "fields")?,
            None => Vec::new(),
        };
        return Ok(Expr::New {
            type_name: type_name.to_string(),
            fields,
        });
    }

    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    Err(ProgramError::Malformed(format!(
        "object with keys {:?} is not an expression (use {{\"lit\": ...}} for literal objects)",
        keys
    )))
}

/// Static checks: known operations with valid arity, bound variables, lambda placement.
fn check<'a>(expr: &'a Expr, scope: &mut Vec<&'a str>, lambda_ok: bool) -> Result<(), ProgramError> {
    match expr {
        Expr::Lit(_) => Ok(()),
        Expr::Var(name) => {
            if scope.contains(&name.as_str()) {
                Ok(())
            } else {
                Err(ProgramError::UnboundVariable(name.clone()))
            }
        }
        Expr::List(items) => items.iter().try_for_each(|i| check(i, scope, false)),
        Expr::Object(fields) | Expr::New { fields, .. } => {
            fields.iter().try_for_each(|(_, e)| check(e, scope, false))
        }
        Expr::Call { op, args } => {
            let (min, max) = eval::builtin_arity(op).ok_or_else(|| ProgramError::UnknownOp(op.clone()))?;
            if args.len() < min || max.is_some_and(|max| args.len() > max) {
                let expected = match max {
                    Some(max) if max == min => min.to_string(),
                    Some(max) => format!("{}..{}", min, max),
                    None => format!("at least {}", min),
                };
                return Err(ProgramError::OpArity {
                    op: op.clone(),
                    expected,
                    found: args.len(),
                });
            }
            let lambda_slot = eval::lambda_slot(op);
            for (i, arg) in args.iter().enumerate() {
                let is_slot = lambda_slot == Some(i);
                if is_slot && !matches!(arg, Expr::Lambda { .. }) {
                    return Err(ProgramError::Malformed(format!(
                        "argument {} of '{}' must be a lambda",
                        i, op
                    )));
                }
                check(arg, scope, is_slot)?;
            }
            Ok(())
        }
        Expr::Lambda { params, body } => {
            if !lambda_ok {
                return Err(ProgramError::MisplacedLambda);
            }
            let depth = scope.len();
            scope.extend(params.iter().map(String::as_str));
            let result = check(body, scope, false);
            scope.truncate(depth);
            result
        }
        Expr::Let { bindings, body } => {
            let depth = scope.len();
            for (name, value) in bindings {
                check(value, scope, false)?;
                scope.push(name);
            }
            let result = check(body, scope, false);
            scope.truncate(depth);
            result
        }
        Expr::If {
            cond,
            then,
            otherwise,
        } => {
            check(cond, scope, false)?;
            check(then, scope, false)?;
            check(otherwise, scope, false)
        }
    }
}

/// A loaded program ready to be invoked.
#[derive(Debug, Clone)]
pub struct Callable {
    program: Arc<Program>,
    fuel: u64,
}

impl Callable {
    pub fn new(program: Program, fuel: u64) -> Self {
        Self {
            program: Arc::new(program),
            fuel,
        }
    }

    /// Loads source and checks it takes exactly `arity` parameters.
    pub fn load(source: &str, arity: usize, fuel: u64) -> Result<Self, ProgramError> {
        let program = Program::load(source)?;
        if program.arity() != arity {
            return Err(ProgramError::ParamArity {
                expected: arity,
                found: program.arity(),
            });
        }
        Ok(Self::new(program, fuel))
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn arity(&self) -> usize {
        self.program.arity()
    }

    /// Invokes the program with positional arguments.
    pub fn call(&self, args: &[LambdaValue]) -> Result<LambdaValue, RuntimeError> {
        if args.len() != self.arity() {
            return Err(RuntimeError::Arity {
                expected: self.arity(),
                found: args.len(),
            });
        }
        eval::run(&self.program, args, self.fuel)
    }
}
