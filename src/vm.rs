use std::thread;
use std::time::Duration;

use chrono::{Datelike, Local, Timelike};
use indexmap::IndexMap;
use log::error;
use rand::Rng;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::ir::Program;
use crate::output::OutputSink;
use crate::value::Value;

pub type VmResult<T> = Result<T, RuntimeError>;

/// Fatal runtime errors. Every variant carries the 1-based program line
/// it was raised from. Unresolvable jump labels are the one non-fatal
/// diagnostic (logged, execution continues) unless strict mode is on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("line {line}: '{opcode}' cannot operate on {type_name}")]
    Type {
        opcode: &'static str,
        type_name: &'static str,
        line: usize,
    },
    #[error("line {line}: malformed '{opcode}' instruction: {message}")]
    Malformed {
        opcode: String,
        message: String,
        line: usize,
    },
    #[error("line {line}: unknown opcode '{opcode}'")]
    UnknownOpcode { opcode: String, line: usize },
    #[error("line {line}: call to undefined function '{name}'")]
    UndefinedFunction { name: String, line: usize },
    #[error("line {line}: division by zero")]
    DivisionByZero { line: usize },
    #[error("line {line}: index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize, line: usize },
    #[error("line {line}: no such key '{key}'")]
    MissingKey { key: String, line: usize },
    #[error("line {line}: no label '{label}' in scope")]
    UnresolvedLabel { label: String, line: usize },
}

enum Flow {
    Next,
    Goto(usize),
    Halt,
}

/// Saved call state, one per active invocation. Positional arguments
/// live in `locals` under the names "0", "1", ….
struct Frame {
    return_pc: usize,
    func: String,
    locals: FxHashMap<String, Value>,
}

/// Iteration bookkeeping for one active `for` loop, keyed by loop
/// variable.
struct LoopState {
    items: Vec<Value>,
    index: usize,
    head: usize,
}

pub struct Vm {
    pc: usize,
    globals: FxHashMap<String, Value>,
    stack: Vec<Frame>,
    loops: FxHashMap<String, LoopState>,
    output: Box<dyn OutputSink>,
    strict_labels: bool,
}

impl Vm {
    pub fn new(output: Box<dyn OutputSink>) -> Self {
        Self {
            pc: 0,
            globals: FxHashMap::default(),
            stack: Vec::new(),
            loops: FxHashMap::default(),
            output,
            strict_labels: false,
        }
    }

    /// Fail fast on unresolvable jump labels instead of logging and
    /// continuing.
    pub fn set_strict_labels(&mut self, strict: bool) {
        self.strict_labels = strict;
    }

    pub fn run(&mut self, program: &Program) -> VmResult<()> {
        self.pc = 0;
        while self.pc < program.lines.len() {
            match self.step(program)? {
                Flow::Next => self.pc += 1,
                Flow::Goto(pc) => self.pc = pc,
                Flow::Halt => break,
            }
        }
        Ok(())
    }

    /// 1-based line for diagnostics.
    fn line(&self) -> usize {
        self.pc + 1
    }

    fn step(&mut self, program: &Program) -> VmResult<Flow> {
        let tokens = &program.lines[self.pc];
        let Some(opcode) = tokens.first().map(String::as_str) else {
            return Ok(Flow::Next);
        };
        if opcode.starts_with('#') {
            return Ok(Flow::Next);
        }

        match opcode {
            "let" => {
                let var = self.operand(tokens, 1, "let")?;
                let value = self.eval(self.operand(tokens, 2, "let")?);
                self.assign(var, value);
                Ok(Flow::Next)
            }
            "prt" => {
                let value = self.eval(self.operand(tokens, 1, "prt")?);
                let end = match tokens.get(2) {
                    Some(token) => self.eval(token).display(),
                    None => "\n".to_string(),
                };
                let text = match value {
                    Value::Nil => "(nil)".to_string(),
                    other => other.display(),
                };
                self.output.print(&text, &end);
                Ok(Flow::Next)
            }
            "inp" => {
                let var = self.operand(tokens, 1, "inp")?;
                let mut buffer = String::new();
                std::io::stdin()
                    .read_line(&mut buffer)
                    .map_err(|err| RuntimeError::Malformed {
                        opcode: "inp".to_string(),
                        message: err.to_string(),
                        line: self.line(),
                    })?;
                let text = buffer.trim_end_matches(['\n', '\r']).to_string();
                self.assign(var, Value::Str(text));
                Ok(Flow::Next)
            }
            "prs" => {
                let var = self.operand(tokens, 1, "prs")?;
                let data = self.eval(self.operand(tokens, 2, "prs")?);
                let Value::Str(text) = data else {
                    return Err(self.type_error("prs", &data));
                };
                let json: serde_json::Value =
                    serde_json::from_str(&text).map_err(|err| RuntimeError::Malformed {
                        opcode: "prs".to_string(),
                        message: err.to_string(),
                        line: self.line(),
                    })?;
                let value = self.json_to_value(&json)?;
                self.assign(var, value);
                Ok(Flow::Next)
            }

            // === jumps ===
            "jmp" => {
                let label = self.operand(tokens, 1, "jmp")?;
                self.jump(program, label)
            }
            "jeq" | "jne" => {
                let left = self.eval(self.operand(tokens, 1, "jeq")?);
                let right = self.eval(self.operand(tokens, 2, "jeq")?);
                let label = self.operand(tokens, 3, "jeq")?;
                let equal = left == right;
                if equal == (opcode == "jeq") {
                    self.jump(program, label)
                } else {
                    Ok(Flow::Next)
                }
            }
            "jlt" | "jgt" => {
                let left = self.eval(self.operand(tokens, 1, "jlt")?);
                let right = self.eval(self.operand(tokens, 2, "jlt")?);
                let label = self.operand(tokens, 3, "jlt")?;
                let left = self.as_int_coerce(&left, "jlt")?;
                let right = self.as_int_coerce(&right, "jlt")?;
                let taken = if opcode == "jlt" {
                    left < right
                } else {
                    left > right
                };
                if taken {
                    self.jump(program, label)
                } else {
                    Ok(Flow::Next)
                }
            }

            // === inline conditional blocks ===
            "ife" => {
                let left = self.eval(self.operand(tokens, 1, "ife")?);
                let right = self.eval(self.operand(tokens, 2, "ife")?);
                if left == right {
                    Ok(Flow::Next)
                } else {
                    Ok(self.skip_conditional(program, true))
                }
            }
            "ifg" => {
                let left = self.eval(self.operand(tokens, 1, "ifg")?);
                let right = self.eval(self.operand(tokens, 2, "ifg")?);
                let left = self.as_int_coerce(&left, "ifg")?;
                let right = self.as_int_coerce(&right, "ifg")?;
                if left > right {
                    Ok(Flow::Next)
                } else {
                    Ok(self.skip_conditional(program, true))
                }
            }
            // Reached inline only after a taken branch: skip the else
            // part to the matching terminator.
            "els" => Ok(self.skip_conditional(program, false)),
            "fin" => Ok(Flow::Next),

            // === arithmetic ===
            "add" => {
                let var = self.operand(tokens, 1, "add")?;
                let left = self.eval(self.operand(tokens, 2, "add")?);
                let right = self.eval(self.operand(tokens, 3, "add")?);
                let result = match (&left, &right) {
                    (Value::Nil, Value::Int(code)) => {
                        let c = u32::try_from(*code)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| RuntimeError::Malformed {
                                opcode: "add".to_string(),
                                message: format!("invalid code point {code}"),
                                line: self.line(),
                            })?;
                        Value::Str(c.to_string())
                    }
                    _ if matches!(left, Value::Str(_)) || matches!(right, Value::Str(_)) => {
                        Value::Str(format!("{}{}", left.display(), right.display()))
                    }
                    _ => Value::Int(self.as_int(&left, "add")? + self.as_int(&right, "add")?),
                };
                self.assign(var, result);
                Ok(Flow::Next)
            }
            "sub" => {
                let var = self.operand(tokens, 1, "sub")?;
                let left = self.eval(self.operand(tokens, 2, "sub")?);
                let right = self.eval(self.operand(tokens, 3, "sub")?);
                let result = match (&left, &right) {
                    (Value::Str(text), Value::Nil) => {
                        let mut chars = text.chars();
                        match (chars.next(), chars.next()) {
                            (Some(c), None) => Value::Int(i64::from(u32::from(c))),
                            _ => return Err(self.type_error("sub", &left)),
                        }
                    }
                    _ => Value::Int(self.as_int(&left, "sub")? - self.as_int(&right, "sub")?),
                };
                self.assign(var, result);
                Ok(Flow::Next)
            }
            "mul" => {
                let var = self.operand(tokens, 1, "mul")?;
                let left = self.eval(self.operand(tokens, 2, "mul")?);
                let right = self.eval(self.operand(tokens, 3, "mul")?);
                let result = match (&left, &right) {
                    (Value::Str(text), Value::Int(count)) if *count > 0 => {
                        Value::Str(text.repeat(*count as usize))
                    }
                    _ => Value::Int(
                        self.as_int_coerce(&left, "mul")? * self.as_int_coerce(&right, "mul")?,
                    ),
                };
                self.assign(var, result);
                Ok(Flow::Next)
            }
            "div" | "mod" => {
                let var = self.operand(tokens, 1, "div")?;
                let left = self.eval(self.operand(tokens, 2, "div")?);
                let right = self.eval(self.operand(tokens, 3, "div")?);
                let left = self.as_int(&left, "div")?;
                let right = self.as_int(&right, "div")?;
                if right == 0 {
                    return Err(RuntimeError::DivisionByZero { line: self.line() });
                }
                let result = if opcode == "div" {
                    floor_div(left, right)
                } else {
                    floor_mod(left, right)
                };
                self.assign(var, Value::Int(result));
                Ok(Flow::Next)
            }

            // === conversions ===
            "int" => {
                let var = self.operand(tokens, 1, "int")?;
                let value = self.eval(self.operand(tokens, 2, "int")?);
                let result = match &value {
                    Value::Int(n) => Value::Int(*n),
                    Value::Str(text) => text
                        .trim()
                        .parse::<i64>()
                        .map_or(Value::Nil, Value::Int),
                    _ => Value::Nil,
                };
                self.assign(var, result);
                Ok(Flow::Next)
            }
            "str" => {
                let var = self.operand(tokens, 1, "str")?;
                let value = self.eval(self.operand(tokens, 2, "str")?);
                self.assign(var, Value::Str(value.display()));
                Ok(Flow::Next)
            }
            "typ" => {
                let var = self.operand(tokens, 1, "typ")?;
                let value = self.eval(self.operand(tokens, 2, "typ")?);
                self.assign(var, Value::Str(value.type_name().to_string()));
                Ok(Flow::Next)
            }

            // === sequences ===
            "psh" => {
                let name = self.var_operand(tokens, 1, "psh")?;
                for token in &tokens[2..] {
                    let value = self.eval(token);
                    let target = self.read_var(name);
                    match target {
                        Value::List(items) => items.borrow_mut().push(value),
                        Value::Str(text) => {
                            let Value::Str(extra) = value else {
                                return Err(self.type_error("psh", &value));
                            };
                            self.assign(name, Value::Str(text + &extra));
                        }
                        other => return Err(self.type_error("psh", &other)),
                    }
                }
                Ok(Flow::Next)
            }
            "pop" => {
                let name = self.var_operand(tokens, 1, "pop")?;
                let var = self.operand(tokens, 2, "pop")?;
                match self.read_var(name) {
                    Value::Str(mut text) => match text.pop() {
                        Some(c) => {
                            self.assign(var, Value::Str(c.to_string()));
                            self.assign(name, Value::Str(text));
                        }
                        None => self.assign(var, Value::Str(String::new())),
                    },
                    Value::List(items) => {
                        let popped = items.borrow_mut().pop();
                        self.assign(var, popped.unwrap_or_default());
                    }
                    other => return Err(self.type_error("pop", &other)),
                }
                Ok(Flow::Next)
            }
            "pol" => {
                let name = self.var_operand(tokens, 1, "pol")?;
                let var = self.operand(tokens, 2, "pol")?;
                match self.read_var(name) {
                    Value::Str(text) => {
                        let mut chars = text.chars();
                        match chars.next() {
                            Some(c) => {
                                let rest = chars.as_str().to_string();
                                self.assign(var, Value::Str(c.to_string()));
                                self.assign(name, Value::Str(rest));
                            }
                            None => self.assign(var, Value::Str(String::new())),
                        }
                    }
                    Value::List(items) => {
                        let first = items.borrow().first().cloned();
                        match first {
                            Some(value) => {
                                let rest = items.borrow()[1..].to_vec();
                                self.assign(var, value);
                                self.assign(name, Value::list(rest));
                            }
                            None => self.assign(var, Value::Nil),
                        }
                    }
                    other => return Err(self.type_error("pol", &other)),
                }
                Ok(Flow::Next)
            }
            "len" => {
                let name = self.var_operand(tokens, 1, "len")?;
                let var = self.operand(tokens, 2, "len")?;
                let length = match self.read_var(name) {
                    Value::Str(text) => text.chars().count(),
                    Value::List(items) => items.borrow().len(),
                    Value::Map(entries) => entries.borrow().len(),
                    other => return Err(self.type_error("len", &other)),
                };
                self.assign(var, Value::Int(length as i64));
                Ok(Flow::Next)
            }

            // === keyed access ===
            "put" => {
                let name = self.var_operand(tokens, 1, "put")?;
                let key = self.eval(self.operand(tokens, 2, "put")?);
                let value = self.eval(self.operand(tokens, 3, "put")?);
                match self.read_var(name) {
                    Value::Map(entries) => {
                        let key = key
                            .as_map_key()
                            .ok_or_else(|| self.type_error("put", &key))?;
                        entries.borrow_mut().insert(key, value);
                    }
                    Value::List(items) => {
                        let index = self.as_int(&key, "put")?;
                        let len = items.borrow().len();
                        let slot = usize::try_from(index)
                            .ok()
                            .filter(|&i| i < len)
                            .ok_or(RuntimeError::IndexOutOfRange {
                                index,
                                len,
                                line: self.line(),
                            })?;
                        items.borrow_mut()[slot] = value;
                    }
                    Value::Str(text) => {
                        let index = self.as_int(&key, "put")?;
                        let chars: Vec<char> = text.chars().collect();
                        let slot = usize::try_from(index)
                            .ok()
                            .filter(|&i| i < chars.len())
                            .ok_or(RuntimeError::IndexOutOfRange {
                                index,
                                len: chars.len(),
                                line: self.line(),
                            })?;
                        let mut replaced: String = chars[..slot].iter().collect();
                        replaced.push_str(&value.display());
                        replaced.extend(&chars[slot + 1..]);
                        self.assign(name, Value::Str(replaced));
                    }
                    other => return Err(self.type_error("put", &other)),
                }
                Ok(Flow::Next)
            }
            "get" => {
                let name = self.var_operand(tokens, 1, "get")?;
                let key = self.eval(self.operand(tokens, 2, "get")?);
                let var = self.operand(tokens, 3, "get")?;
                let value = match self.read_var(name) {
                    Value::Map(entries) => {
                        let key = key
                            .as_map_key()
                            .ok_or_else(|| self.type_error("get", &key))?;
                        entries.borrow().get(&key).cloned().unwrap_or_default()
                    }
                    Value::List(items) => {
                        let index = self.as_int(&key, "get")?;
                        usize::try_from(index)
                            .ok()
                            .and_then(|i| items.borrow().get(i).cloned())
                            .unwrap_or_default()
                    }
                    Value::Str(text) => {
                        let index = self.as_int(&key, "get")?;
                        let c = usize::try_from(index)
                            .ok()
                            .and_then(|i| text.chars().nth(i));
                        match c {
                            Some(c) => Value::Str(c.to_string()),
                            None => Value::Str(String::new()),
                        }
                    }
                    other => return Err(self.type_error("get", &other)),
                };
                self.assign(var, value);
                Ok(Flow::Next)
            }
            "key" => {
                let name = self.var_operand(tokens, 1, "key")?;
                let var = self.operand(tokens, 2, "key")?;
                match self.read_var(name) {
                    Value::Map(entries) => {
                        let keys = entries
                            .borrow()
                            .keys()
                            .map(|key| Value::Str(key.clone()))
                            .collect();
                        self.assign(var, Value::list(keys));
                    }
                    other => return Err(self.type_error("key", &other)),
                }
                Ok(Flow::Next)
            }
            "del" => {
                let name = self.var_operand(tokens, 1, "del")?;
                let key = self.eval(self.operand(tokens, 2, "del")?);
                match self.read_var(name) {
                    Value::Map(entries) => {
                        let key = key
                            .as_map_key()
                            .ok_or_else(|| self.type_error("del", &key))?;
                        if entries.borrow_mut().shift_remove(&key).is_none() {
                            return Err(RuntimeError::MissingKey {
                                key,
                                line: self.line(),
                            });
                        }
                    }
                    other => return Err(self.type_error("del", &other)),
                }
                Ok(Flow::Next)
            }

            // === misc ===
            "rnd" => {
                let var = self.operand(tokens, 1, "rnd")?;
                let low = self.eval(self.operand(tokens, 2, "rnd")?);
                let high = self.eval(self.operand(tokens, 3, "rnd")?);
                let low = self.as_int(&low, "rnd")?;
                let high = self.as_int(&high, "rnd")?;
                if high < low {
                    return Err(RuntimeError::Malformed {
                        opcode: "rnd".to_string(),
                        message: format!("empty range {low}..{high}"),
                        line: self.line(),
                    });
                }
                let value = rand::thread_rng().gen_range(low..=high);
                self.assign(var, Value::Int(value));
                Ok(Flow::Next)
            }
            "tim" => {
                let var = self.operand(tokens, 1, "tim")?;
                let field = self.eval(self.operand(tokens, 2, "tim")?).display();
                let now = Local::now();
                let value = match field.as_str() {
                    "year" => i64::from(now.year()),
                    "month" => i64::from(now.month()),
                    "date" => i64::from(now.day()),
                    "day" => i64::from(now.weekday().number_from_monday()),
                    "hour" => i64::from(now.hour()),
                    "minute" => i64::from(now.minute()),
                    "second" => i64::from(now.second()),
                    "milli" => i64::from(now.timestamp_subsec_millis()),
                    "now" => now.timestamp_millis(),
                    _ => -1,
                };
                self.assign(var, Value::Int(value));
                Ok(Flow::Next)
            }
            "slp" => {
                let millis = self.eval(self.operand(tokens, 1, "slp")?);
                let millis = self.as_int(&millis, "slp")?;
                if millis > 0 {
                    thread::sleep(Duration::from_millis(millis as u64));
                }
                Ok(Flow::Next)
            }

            // === functions ===
            "def" => Ok(self.skip_function(program)),
            "cal" => {
                let name = self.operand(tokens, 1, "cal")?;
                let Some(&entry) = program.funcs.get(name) else {
                    return Err(RuntimeError::UndefinedFunction {
                        name: name.to_string(),
                        line: self.line(),
                    });
                };
                let mut locals = FxHashMap::default();
                for (position, token) in tokens[2..].iter().enumerate() {
                    locals.insert(position.to_string(), self.eval(token));
                }
                self.stack.push(Frame {
                    return_pc: self.pc + 1,
                    func: name.to_string(),
                    locals,
                });
                Ok(Flow::Goto(entry))
            }
            "ret" | "end" => {
                // The value is evaluated in the returning function's
                // scope, the binding happens in the restored one.
                let value = if opcode == "ret" {
                    Some(
                        tokens
                            .get(1)
                            .map(|token| self.eval(token))
                            .unwrap_or_default(),
                    )
                } else {
                    None
                };
                match self.stack.pop() {
                    Some(frame) => {
                        if let Some(value) = value {
                            self.assign("ret", value);
                        }
                        Ok(Flow::Goto(frame.return_pc))
                    }
                    None => Ok(Flow::Halt),
                }
            }

            // === loops ===
            "for" => self.exec_for(program, tokens),
            "nxt" => self.back_to_loop_head(program),

            _ => Err(RuntimeError::UnknownOpcode {
                opcode: opcode.to_string(),
                line: self.line(),
            }),
        }
    }

    fn exec_for(&mut self, program: &Program, tokens: &[String]) -> VmResult<Flow> {
        let var = self.operand(tokens, 1, "for")?;
        let range_token = self.operand(tokens, 2, "for")?;

        // A state recorded at another head PC belongs to a different
        // loop that happens to reuse the variable name; start fresh.
        let needs_init = self
            .loops
            .get(var)
            .is_none_or(|state| state.head != self.pc);
        if needs_init {
            let items = match self.eval(range_token) {
                Value::Int(n) => (0..n.max(0)).map(Value::Int).collect(),
                Value::List(items) => items.borrow().clone(),
                Value::Str(text) => text.chars().map(|c| Value::Str(c.to_string())).collect(),
                Value::Map(entries) => entries
                    .borrow()
                    .keys()
                    .map(|key| Value::Str(key.clone()))
                    .collect(),
                Value::Nil => Vec::new(),
            };
            self.loops.insert(
                var.to_string(),
                LoopState {
                    items,
                    index: 0,
                    head: self.pc,
                },
            );
        }

        let next = self.loops.get_mut(var).and_then(|state| {
            let item = state.items.get(state.index).cloned();
            state.index += 1;
            item
        });
        match next {
            Some(item) => {
                self.assign(var, item);
                Ok(Flow::Next)
            }
            None => {
                self.loops.remove(var);
                Ok(self.skip_loop(program))
            }
        }
    }

    // -- control-flow scans; all nesting-aware via a depth counter --

    fn skip_conditional(&self, program: &Program, stop_at_else: bool) -> Flow {
        let mut depth = 0usize;
        let mut pc = self.pc + 1;
        while pc < program.lines.len() {
            match program.lines[pc].first().map(String::as_str) {
                Some("ife") | Some("ifg") => depth += 1,
                Some("fin") => {
                    if depth == 0 {
                        return Flow::Goto(pc + 1);
                    }
                    depth -= 1;
                }
                Some("els") if stop_at_else && depth == 0 => return Flow::Goto(pc + 1),
                _ => {}
            }
            pc += 1;
        }
        Flow::Goto(program.lines.len())
    }

    fn skip_loop(&self, program: &Program) -> Flow {
        let mut depth = 0usize;
        let mut pc = self.pc + 1;
        while pc < program.lines.len() {
            match program.lines[pc].first().map(String::as_str) {
                Some("for") => depth += 1,
                Some("nxt") => {
                    if depth == 0 {
                        return Flow::Goto(pc + 1);
                    }
                    depth -= 1;
                }
                _ => {}
            }
            pc += 1;
        }
        Flow::Goto(program.lines.len())
    }

    fn back_to_loop_head(&self, program: &Program) -> VmResult<Flow> {
        let mut depth = 0usize;
        let mut pc = self.pc;
        while pc > 0 {
            pc -= 1;
            match program.lines[pc].first().map(String::as_str) {
                Some("for") => {
                    if depth == 0 {
                        return Ok(Flow::Goto(pc));
                    }
                    depth -= 1;
                }
                Some("nxt") => depth += 1,
                _ => {}
            }
        }
        Err(RuntimeError::Malformed {
            opcode: "nxt".to_string(),
            message: "no matching 'for'".to_string(),
            line: self.line(),
        })
    }

    /// A definition reached by straight-line execution is skipped to its
    /// closing marker (function bodies never nest).
    fn skip_function(&self, program: &Program) -> Flow {
        let mut pc = self.pc + 1;
        while pc < program.lines.len() {
            if program.lines[pc].first().is_some_and(|op| op == "end") {
                return Flow::Goto(pc + 1);
            }
            pc += 1;
        }
        Flow::Goto(program.lines.len())
    }

    fn jump(&mut self, program: &Program, label: &str) -> VmResult<Flow> {
        let scope = self.stack.last().map(|frame| frame.func.as_str());
        match program.labels.lookup(scope, label) {
            Some(pc) => Ok(Flow::Goto(pc)),
            None if self.strict_labels => Err(RuntimeError::UnresolvedLabel {
                label: label.to_string(),
                line: self.line(),
            }),
            None => {
                error!("line {}: no label '{label}' in scope", self.line());
                Ok(Flow::Next)
            }
        }
    }

    // -- operand resolution and scoping --

    /// Resolve one operand token to a value. `$name` follows the scoping
    /// rule, quoted operands are strings, bare decimals are integers,
    /// `[]`/`{}` are fresh empty collections, and anything else is a
    /// literal of itself.
    fn eval(&self, token: &str) -> Value {
        if let Some(name) = token.strip_prefix('$') {
            if name == "nil" {
                return Value::Nil;
            }
            return self.read_var(name);
        }
        match token {
            "[]" => Value::list(Vec::new()),
            "{}" => Value::map(IndexMap::new()),
            _ => {
                if token.len() >= 2 && token.starts_with('\'') && token.ends_with('\'') {
                    Value::Str(token[1..token.len() - 1].to_string())
                } else if let Ok(number) = token.parse::<i64>() {
                    Value::Int(number)
                } else {
                    Value::Str(token.to_string())
                }
            }
        }
    }

    fn read_var(&self, name: &str) -> Value {
        if let Some(frame) = self.stack.last()
            && is_frame_name(name)
        {
            return frame.locals.get(name).cloned().unwrap_or_default();
        }
        self.globals.get(name).cloned().unwrap_or_default()
    }

    fn assign(&mut self, name: &str, value: Value) {
        if let Some(frame) = self.stack.last_mut()
            && is_frame_name(name)
        {
            frame.locals.insert(name.to_string(), value);
            return;
        }
        self.globals.insert(name.to_string(), value);
    }

    fn operand<'t>(
        &self,
        tokens: &'t [String],
        index: usize,
        opcode: &'static str,
    ) -> VmResult<&'t str> {
        tokens
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| RuntimeError::Malformed {
                opcode: opcode.to_string(),
                message: format!("missing operand {index}"),
                line: self.line(),
            })
    }

    /// Collection opcodes address their target through a `$name`
    /// reference so they can rebind it.
    fn var_operand<'t>(
        &self,
        tokens: &'t [String],
        index: usize,
        opcode: &'static str,
    ) -> VmResult<&'t str> {
        let token = self.operand(tokens, index, opcode)?;
        token
            .strip_prefix('$')
            .ok_or_else(|| RuntimeError::Malformed {
                opcode: opcode.to_string(),
                message: format!("expected a variable reference, got '{token}'"),
                line: self.line(),
            })
    }

    fn as_int(&self, value: &Value, opcode: &'static str) -> VmResult<i64> {
        match value {
            Value::Int(number) => Ok(*number),
            other => Err(self.type_error(opcode, other)),
        }
    }

    /// Like `as_int`, but also accepts numeric strings.
    fn as_int_coerce(&self, value: &Value, opcode: &'static str) -> VmResult<i64> {
        match value {
            Value::Int(number) => Ok(*number),
            Value::Str(text) => text
                .trim()
                .parse::<i64>()
                .map_err(|_| self.type_error(opcode, value)),
            other => Err(self.type_error(opcode, other)),
        }
    }

    fn type_error(&self, opcode: &'static str, value: &Value) -> RuntimeError {
        RuntimeError::Type {
            opcode,
            type_name: value.type_name(),
            line: self.line(),
        }
    }

    fn json_to_value(&self, json: &serde_json::Value) -> VmResult<Value> {
        let value = match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(flag) => Value::Int(i64::from(*flag)),
            serde_json::Value::Number(number) => {
                let number = number.as_i64().ok_or_else(|| RuntimeError::Malformed {
                    opcode: "prs".to_string(),
                    message: format!("non-integer number {number}"),
                    line: self.line(),
                })?;
                Value::Int(number)
            }
            serde_json::Value::String(text) => Value::Str(text.clone()),
            serde_json::Value::Array(items) => {
                let mut converted = Vec::with_capacity(items.len());
                for item in items {
                    converted.push(self.json_to_value(item)?);
                }
                Value::list(converted)
            }
            serde_json::Value::Object(entries) => {
                let mut converted = IndexMap::with_capacity(entries.len());
                for (key, item) in entries {
                    converted.insert(key.clone(), self.json_to_value(item)?);
                }
                Value::map(converted)
            }
        };
        Ok(value)
    }
}

fn is_frame_name(name: &str) -> bool {
    name == "ret"
        || name.starts_with('_')
        || (!name.is_empty() && name.chars().all(|c| c.is_ascii_digit()))
}

/// Python-style floor division and remainder.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) { r + b } else { r }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir;
    use crate::output::CaptureSink;
    use indoc::indoc;

    fn run(text: &str) -> String {
        let (sink, buffer) = CaptureSink::new();
        let program = ir::load(text);
        let mut vm = Vm::new(Box::new(sink));
        vm.run(&program).expect("run failed");
        let output = buffer.borrow().clone();
        output
    }

    fn run_err(text: &str) -> RuntimeError {
        let (sink, _buffer) = CaptureSink::new();
        let program = ir::load(text);
        let mut vm = Vm::new(Box::new(sink));
        vm.run(&program).expect_err("expected runtime failure")
    }

    #[test]
    fn for_over_int_counts_from_zero() {
        let output = run(indoc! {"
            for v 3
             prt $v
            nxt
        "});
        assert_eq!(output, "0\n1\n2\n");
    }

    #[test]
    fn for_over_string_yields_characters() {
        let output = run(indoc! {"
            for v 'ab'
             prt $v
            nxt
        "});
        assert_eq!(output, "a\nb\n");
    }

    #[test]
    fn for_over_list_and_map() {
        let output = run(indoc! {"
            let l []
            psh $l 10 20
            for v $l
             prt $v
            nxt
            let m {}
            put $m 'x' 1
            put $m 'y' 2
            for k $m
             prt $k
            nxt
        "});
        assert_eq!(output, "10\n20\nx\ny\n");
    }

    #[test]
    fn nested_loops_match_their_own_partners() {
        let output = run(indoc! {"
            for i 2
             let marker 'between'
             for j 3
              prt $j ''
             nxt
             prt $i
            nxt
        "});
        assert_eq!(output, "0120\n0121\n");
    }

    #[test]
    fn exhausted_loop_over_empty_range_skips_body() {
        let output = run(indoc! {"
            for v 0
             prt 'never'
            nxt
            prt 'done'
        "});
        assert_eq!(output, "done\n");
    }

    #[test]
    fn labels_drive_a_counting_loop() {
        let output = run(indoc! {"
            let i 0
            #top
            jeq $i 3 done
            prt $i
            add i $i 1
            jmp top
            #done
            prt 'done'
        "});
        assert_eq!(output, "0\n1\n2\ndone\n");
    }

    #[test]
    fn function_labels_are_invisible_from_global_scope() {
        // The jump logs an error and execution continues.
        let output = run(indoc! {"
            jmp inner
            prt 'after'
            def f
             #inner
             prt 'inside'
            end
        "});
        assert_eq!(output, "after\n");
    }

    #[test]
    fn global_labels_are_invisible_from_function_scope() {
        let output = run(indoc! {"
            #outer
            jmp main
            def f
             jmp outer
             prt 'in-function'
            end
            #main
            cal f
            prt 'done'
        "});
        assert_eq!(output, "in-function\ndone\n");
    }

    #[test]
    fn strict_mode_fails_fast_on_unresolved_labels() {
        let (sink, _buffer) = CaptureSink::new();
        let program = ir::load("jmp nowhere");
        let mut vm = Vm::new(Box::new(sink));
        vm.set_strict_labels(true);
        let err = vm.run(&program).expect_err("expected failure");
        assert_eq!(
            err,
            RuntimeError::UnresolvedLabel {
                label: "nowhere".to_string(),
                line: 1,
            }
        );
    }

    #[test]
    fn add_nil_and_code_point_makes_a_character() {
        let output = run("add v $nil 65\nprt $v");
        assert_eq!(output, "A\n");
    }

    #[test]
    fn sub_character_and_nil_makes_a_code_point() {
        let output = run("sub v 'A' $nil\nprt $v");
        assert_eq!(output, "65\n");
    }

    #[test]
    fn mul_repeats_strings() {
        let output = run("mul v 'ab' 3\nprt $v");
        assert_eq!(output, "ababab\n");
    }

    #[test]
    fn add_concatenates_when_either_side_is_a_string() {
        let output = run("add v 'n=' 4\nprt $v\nadd w 1 '2'\nprt $w");
        assert_eq!(output, "n=4\n12\n");
    }

    #[test]
    fn division_and_remainder_floor_like_the_source_language() {
        let output = run(indoc! {"
            div a 7 2
            prt $a
            div b -7 2
            prt $b
            mod c -7 3
            prt $c
        "});
        assert_eq!(output, "3\n-4\n2\n");
    }

    #[test]
    fn division_by_zero_is_fatal() {
        assert_eq!(run_err("div x 1 0"), RuntimeError::DivisionByZero { line: 1 });
    }

    #[test]
    fn return_binds_the_caller_return_slot() {
        let output = run(indoc! {"
            jmp main
            def fortytwo
             ret 42
            end
            #main
            cal fortytwo
            prt $ret
        "});
        assert_eq!(output, "42\n");
    }

    #[test]
    fn function_without_return_leaves_the_slot_nil() {
        let output = run(indoc! {"
            jmp main
            def noop
             let _x 1
            end
            #main
            cal noop
            prt $ret
        "});
        assert_eq!(output, "(nil)\n");
    }

    #[test]
    fn recursion_keeps_locals_per_frame() {
        let output = run(indoc! {"
            jmp main
            def fact
             let _n $0
             jeq $_n 0 base
             sub __t $_n 1
             cal fact $__t
             mul __m $_n $ret
             ret $__m
             #base
             ret 1
            end
            #main
            cal fact 5
            prt $ret
        "});
        assert_eq!(output, "120\n");
    }

    #[test]
    fn call_to_undefined_function_is_fatal() {
        assert_eq!(
            run_err("cal missing"),
            RuntimeError::UndefinedFunction {
                name: "missing".to_string(),
                line: 1,
            }
        );
    }

    #[test]
    fn top_level_return_ends_the_program() {
        let output = run("prt 'before'\nret\nprt 'after'");
        assert_eq!(output, "before\n");
    }

    #[test]
    fn inline_conditionals_nest_without_breaking_the_outer_block() {
        let output = run(indoc! {"
            ife 1 1
             prt 'outer-true' ''
             ife 1 2
              prt 'inner-true' ''
             els
              prt 'inner-false' ''
             fin
             prt 'outer-end' ''
            els
             prt 'outer-false' ''
            fin
            prt ''
        "});
        assert_eq!(output, "outer-trueinner-falseouter-end\n");
    }

    #[test]
    fn skipped_outer_block_steps_over_nested_pairs() {
        let output = run(indoc! {"
            ife 1 2
             ife 1 1
              prt 'x'
             fin
             prt 'inner-done'
            els
             prt 'outer-else'
            fin
        "});
        assert_eq!(output, "outer-else\n");
    }

    #[test]
    fn ifg_enters_on_strictly_greater() {
        let output = run(indoc! {"
            ifg 2 1
             prt 'yes'
            fin
            ifg 1 1
             prt 'no'
            fin
        "});
        assert_eq!(output, "yes\n");
    }

    #[test]
    fn jeq_compares_lists_element_wise() {
        let output = run(indoc! {"
            let a []
            psh $a 1 2
            let b []
            psh $b 1 2
            jeq $a $b same
            prt 'different'
            #same
            prt 'equal'
        "});
        assert_eq!(output, "equal\n");
    }

    #[test]
    fn push_and_pop_on_lists_and_strings() {
        let output = run(indoc! {"
            let l []
            psh $l 1 2 3
            pop $l last
            prt $last
            pol $l first
            prt $first
            len $l n
            prt $n
            let s 'ab'
            psh $s 'c'
            pop $s tail
            prt $tail
            prt $s
        "});
        assert_eq!(output, "3\n1\n1\nc\nab\n");
    }

    #[test]
    fn pop_from_empty_sources_yields_defaults() {
        let output = run(indoc! {"
            let l []
            pop $l a
            prt $a
            let s ''
            pop $s b
            prt $b ''
            prt 'x'
        "});
        assert_eq!(output, "(nil)\nx\n");
    }

    #[test]
    fn map_put_get_keys_and_delete() {
        let output = run(indoc! {"
            let m {}
            put $m 'one' 1
            put $m 'two' 2
            get $m 'one' v
            prt $v
            get $m 'missing' w
            prt $w
            key $m ks
            prt $ks
            del $m 'one'
            len $m n
            prt $n
        "});
        assert_eq!(output, "1\n(nil)\n['one', 'two']\n1\n");
    }

    #[test]
    fn get_out_of_range_defaults_per_type() {
        let output = run(indoc! {"
            let l []
            psh $l 9
            get $l 5 a
            prt $a
            let s 'xy'
            get $s 7 b
            prt $b ''
            get $s 1 c
            prt $c
        "});
        assert_eq!(output, "(nil)\ny\n");
    }

    #[test]
    fn put_replaces_one_character_of_a_string() {
        let output = run("let s 'cat'\nput $s 1 'o'\nprt $s");
        assert_eq!(output, "cot\n");
    }

    #[test]
    fn conversions_between_kinds() {
        let output = run(indoc! {"
            int a '12'
            prt $a
            int b 'oops'
            prt $b
            str c 34
            prt $c
            typ d $a
            prt $d
            let l []
            typ e $l
            prt $e
        "});
        assert_eq!(output, "12\n(nil)\n34\nint\nlist\n");
    }

    #[test]
    fn prs_parses_json_into_values() {
        let output = run(indoc! {"
            prs v '{\"a\": [1, 2], \"b\": \"x\"}'
            get $v 'a' items
            len $items n
            prt $n
            get $v 'b' b
            prt $b
        "});
        assert_eq!(output, "2\nx\n");
    }

    #[test]
    fn rnd_stays_in_range() {
        let output = run("rnd v 3 3\nprt $v");
        assert_eq!(output, "3\n");
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        assert_eq!(
            run_err("frobnicate x"),
            RuntimeError::UnknownOpcode {
                opcode: "frobnicate".to_string(),
                line: 1,
            }
        );
    }

    #[test]
    fn missing_operands_are_fatal() {
        assert!(matches!(run_err("let x"), RuntimeError::Malformed { .. }));
    }

    #[test]
    fn type_mismatches_are_fatal() {
        let err = run_err("let l []\nadd x $l 1");
        assert_eq!(
            err,
            RuntimeError::Type {
                opcode: "add",
                type_name: "list",
                line: 2,
            }
        );
    }

    #[test]
    fn blank_comment_and_label_lines_are_noops() {
        let output = run("\n/ nothing here\n#lbl\nprt 'ok'");
        assert_eq!(output, "ok\n");
    }

    #[test]
    fn bare_tokens_evaluate_to_themselves() {
        let output = run("let x hello\nprt $x");
        assert_eq!(output, "hello\n");
    }

    #[test]
    fn shared_lists_alias_across_variables() {
        let output = run(indoc! {"
            let a []
            let b $a
            psh $b 7
            len $a n
            prt $n
        "});
        assert_eq!(output, "1\n");
    }

    #[test]
    fn methods_mutate_their_receiver_through_the_shared_map() {
        // Hand-written shape of the class desugaring: the instance map
        // passed as argument 0 aliases the caller's value.
        let output = run(indoc! {"
            jmp main
            def Counter:bump
             let _this $0
             get $_this 'n' __cur
             add __next $__cur 1
             put $_this 'n' $__next
            end
            #main
            let c {}
            put $c 'n' 0
            cal Counter:bump $c
            cal Counter:bump $c
            get $c 'n' v
            prt $v
        "});
        assert_eq!(output, "2\n");
    }
}
