use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use super::ast::{BinOp, Expr, Stmt, StmtKind, UnOp};
use crate::error::{ScriptError, StepError};
use crate::logger;
use crate::types::{CancelToken, StepResult};

/// Operations a script can reach. Nothing else is callable.
pub trait Host {
    fn step(&mut self, goal: &str, expect: Option<&str>) -> Result<StepResult, StepError>;
    fn ask(&mut self, question: &str) -> Result<String, StepError>;
    fn checkpoint(&mut self, description: &str) -> Result<bool, StepError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Number(f64),
    Str(String),
    Step(StepResult),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Step(r) => r.success,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Step(_) => "step result",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("none"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
            Value::Step(r) => write!(f, "step(success={}, state={:?})", r.success, r.state),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_steps: usize,
    pub max_instructions: usize,
    /// Longest string, in bytes, a script may build
    pub max_string_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_steps: 50, max_instructions: 100_000, max_string_len: 65_536 }
    }
}

/// One `step()` call as seen by the script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepLog {
    pub goal: String,
    pub success: bool,
    pub retries: u32,
    pub error: Option<String>,
}

enum Flow {
    Normal,
    Break,
    Continue,
}

pub struct Interpreter<'h, H: Host> {
    host: &'h mut H,
    limits: Limits,
    cancel: CancelToken,
    scopes: Vec<HashMap<String, Value>>,
    instructions: usize,
    pub(super) steps: Vec<StepLog>,
    pub(super) output: Vec<String>,
}

fn runtime(line: usize, msg: impl fmt::Display) -> ScriptError {
    ScriptError::Runtime(format!("line {}: {}", line, msg))
}

impl<'h, H: Host> Interpreter<'h, H> {
    pub fn new(host: &'h mut H, limits: Limits, cancel: CancelToken) -> Self {
        Self {
            host,
            limits,
            cancel,
            scopes: vec![HashMap::new()],
            instructions: 0,
            steps: Vec::new(),
            output: Vec::new(),
        }
    }

    pub fn run(&mut self, program: &[Stmt]) -> Result<(), ScriptError> {
        match self.exec_block(program)? {
            Flow::Normal => Ok(()),
            Flow::Break | Flow::Continue => Err(ScriptError::Runtime("break/continue outside a loop".into())),
        }
    }

    fn tick(&mut self) -> Result<(), ScriptError> {
        if self.cancel.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }
        self.instructions += 1;
        if self.instructions > self.limits.max_instructions {
            return Err(ScriptError::InstructionLimit(self.limits.max_instructions));
        }
        Ok(())
    }

    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.scopes.push(HashMap::new());
        let out = f(self);
        self.scopes.pop();
        out
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow, ScriptError> {
        for stmt in stmts {
            match self.exec(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        self.tick()?;
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                let v = self.eval(value, line)?;
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(name.clone(), v);
                }
            }
            StmtKind::Assign { name, value } => {
                let v = self.eval(value, line)?;
                let slot = self
                    .scopes
                    .iter_mut()
                    .rev()
                    .find_map(|s| s.get_mut(name))
                    .ok_or_else(|| runtime(line, format!("assignment to undeclared variable '{}'", name)))?;
                *slot = v;
            }
            StmtKind::If { branches, otherwise } => {
                for (cond, body) in branches {
                    if self.eval(cond, line)?.truthy() {
                        return self.scoped(|me| me.exec_block(body));
                    }
                }
                if let Some(body) = otherwise {
                    return self.scoped(|me| me.exec_block(body));
                }
            }
            StmtKind::While { cond, body } => {
                while self.eval(cond, line)?.truthy() {
                    self.tick()?;
                    match self.scoped(|me| me.exec_block(body))? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                    }
                }
            }
            StmtKind::For { var, from, to, body } => {
                let from = self.number(from, line)?;
                let to = self.number(to, line)?;
                let mut i = from;
                while i < to {
                    self.tick()?;
                    let flow = self.scoped(|me| {
                        if let Some(scope) = me.scopes.last_mut() {
                            scope.insert(var.clone(), Value::Number(i));
                        }
                        me.exec_block(body)
                    })?;
                    if let Flow::Break = flow {
                        break;
                    }
                    i += 1.0;
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Expr(e) => {
                self.eval(e, line)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn number(&mut self, e: &Expr, line: usize) -> Result<f64, ScriptError> {
        match self.eval(e, line)? {
            Value::Number(n) => Ok(n),
            other => Err(runtime(line, format!("expected a number, got {}", other.type_name()))),
        }
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn eval(&mut self, e: &Expr, line: usize) -> Result<Value, ScriptError> {
        match e {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Var(name) => self
                .lookup(name)
                .cloned()
                .ok_or_else(|| runtime(line, format!("undefined variable '{}'", name))),
            Expr::Field(target, field) => {
                let v = self.eval(target, line)?;
                field_of(&v, field).ok_or_else(|| runtime(line, format!("{} has no field '{}'", v.type_name(), field)))
            }
            Expr::Unary(UnOp::Not, inner) => Ok(Value::Bool(!self.eval(inner, line)?.truthy())),
            Expr::Unary(UnOp::Neg, inner) => Ok(Value::Number(-self.number(inner, line)?)),
            Expr::Binary(BinOp::And, l, r) => {
                Ok(Value::Bool(self.eval(l, line)?.truthy() && self.eval(r, line)?.truthy()))
            }
            Expr::Binary(BinOp::Or, l, r) => {
                Ok(Value::Bool(self.eval(l, line)?.truthy() || self.eval(r, line)?.truthy()))
            }
            Expr::Binary(op, l, r) => {
                let l = self.eval(l, line)?;
                let r = self.eval(r, line)?;
                let v = binary(*op, l, r).map_err(|m| runtime(line, m))?;
                self.bounded(v, line)
            }
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.eval(a, line)?);
                }
                self.call(name, values, line)
            }
        }
    }

    fn bounded(&self, v: Value, line: usize) -> Result<Value, ScriptError> {
        match &v {
            Value::Str(s) if s.len() > self.limits.max_string_len => {
                Err(runtime(line, format!("string longer than {} bytes", self.limits.max_string_len)))
            }
            _ => Ok(v),
        }
    }

    fn call(&mut self, name: &str, args: Vec<Value>, line: usize) -> Result<Value, ScriptError> {
        let arity = |min: usize, max: usize| {
            if args.len() < min || args.len() > max {
                Err(runtime(line, format!("{}() takes {} to {} argument(s), got {}", name, min, max, args.len())))
            } else {
                Ok(())
            }
        };
        match name {
            "step" => {
                arity(1, 2)?;
                let goal = text_arg(&args[0], name, line)?;
                let expect = match args.get(1) {
                    None | Some(Value::None) => None,
                    Some(v) => Some(text_arg(v, name, line)?),
                };
                self.step(goal, expect)
            }
            "ask" => {
                arity(1, 1)?;
                let q = text_arg(&args[0], name, line)?;
                logger::info_p("script", &format!("ask: {}", q));
                Ok(Value::Str(self.host.ask(&q)?))
            }
            "checkpoint" => {
                arity(1, 1)?;
                let d = text_arg(&args[0], name, line)?;
                logger::info_p("script", &format!("checkpoint: {}", d));
                Ok(Value::Bool(self.host.checkpoint(&d)?))
            }
            "log" => {
                let text = args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
                logger::info_p("script", &text);
                self.output.push(text);
                Ok(Value::None)
            }
            "str" => {
                arity(1, 1)?;
                self.bounded(Value::Str(args[0].to_string()), line)
            }
            "len" => {
                arity(1, 1)?;
                match &args[0] {
                    Value::Str(s) => Ok(Value::Number(s.chars().count() as f64)),
                    other => Err(runtime(line, format!("len() of {}", other.type_name()))),
                }
            }
            _ => Err(runtime(line, format!("unknown function '{}'", name))),
        }
    }

    fn step(&mut self, goal: String, expect: Option<String>) -> Result<Value, ScriptError> {
        if self.steps.len() >= self.limits.max_steps {
            return Err(ScriptError::StepLimit(self.limits.max_steps));
        }
        logger::info_p("script", &format!("step #{}: {}", self.steps.len() + 1, goal));
        let result = self.host.step(&goal, expect.as_deref())?;
        self.steps.push(StepLog {
            goal: goal.clone(),
            success: result.success,
            retries: result.retries,
            error: result.error.clone(),
        });
        if !result.success {
            let reason = result.error.unwrap_or_else(|| "verification failed".into());
            return Err(ScriptError::StepFailed { goal, reason });
        }
        Ok(Value::Step(result))
    }
}

fn text_arg(v: &Value, func: &str, line: usize) -> Result<String, ScriptError> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(runtime(line, format!("{}() expects a string, got {}", func, other.type_name()))),
    }
}

fn field_of(v: &Value, field: &str) -> Option<Value> {
    let Value::Step(r) = v else { return None };
    Some(match field {
        "success" => Value::Bool(r.success),
        "state" => Value::Str(r.state.clone()),
        "has_more" => Value::Bool(r.has_more),
        "retries" => Value::Number(r.retries as f64),
        "error" => r.error.clone().map(Value::Str).unwrap_or(Value::None),
        _ => return None,
    })
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, String> {
    use Value::*;
    match (op, l, r) {
        (BinOp::Eq, a, b) => Ok(Bool(a == b)),
        (BinOp::Ne, a, b) => Ok(Bool(a != b)),
        (BinOp::Add, Str(a), b) => Ok(Str(format!("{}{}", a, b))),
        (BinOp::Add, a, Str(b)) => Ok(Str(format!("{}{}", a, b))),
        (op, Number(a), Number(b)) => match op {
            BinOp::Add => Ok(Number(a + b)),
            BinOp::Sub => Ok(Number(a - b)),
            BinOp::Mul => Ok(Number(a * b)),
            BinOp::Div if b == 0.0 => Err("division by zero".into()),
            BinOp::Div => Ok(Number(a / b)),
            BinOp::Rem if b == 0.0 => Err("modulo by zero".into()),
            BinOp::Rem => Ok(Number(a % b)),
            BinOp::Lt => Ok(Bool(a < b)),
            BinOp::Le => Ok(Bool(a <= b)),
            BinOp::Gt => Ok(Bool(a > b)),
            BinOp::Ge => Ok(Bool(a >= b)),
            _ => Err(format!("unsupported operator {:?}", op)),
        },
        (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, Str(a), Str(b)) => Ok(Bool(match op {
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Gt => a > b,
            _ => a >= b,
        })),
        (op, a, b) => Err(format!("cannot apply {:?} to {} and {}", op, a.type_name(), b.type_name())),
    }
}
