use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::ast::{Node, NodeKind};
use crate::token::TokenKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Unsupported operator '{operator}' at line {line}")]
    UnsupportedOperator { operator: String, line: usize },
    #[error("'{construct}' has no instruction lowering (line {line})")]
    UnsupportedConstruct { construct: String, line: usize },
    #[error("Invalid assignment target at line {line}")]
    InvalidAssignmentTarget { line: usize },
    #[error("Expression produced no value at line {line}")]
    ExpressionHasNoValue { line: usize },
    #[error("Nested function definitions are not supported (line {line})")]
    NestedFunctionDefinition { line: usize },
    #[error("Cannot resolve the class of '{receiver}' for a method call (line {line})")]
    UnknownReceiverClass { receiver: String, line: usize },
    #[error("Class '{class}' has no method '{method}' (line {line})")]
    UnknownMethod {
        class: String,
        method: String,
        line: usize,
    },
    #[error("Malformed {kind} node (line {line})")]
    MalformedNode { kind: String, line: usize },
}

#[derive(Debug, Clone, Default)]
struct ClassInfo {
    attributes: Vec<(String, Node)>,
    methods: Vec<(String, Node)>,
}

impl ClassInfo {
    fn method(&self, name: &str) -> Option<&Node> {
        self.methods
            .iter()
            .find(|(method, _)| method == name)
            .map(|(_, def)| def)
    }

    fn init_arity(&self) -> Option<usize> {
        self.method("init")
            .and_then(|def| def.children.get(1))
            .map(|args| args.children.len())
    }
}

/// Code-generation session. Holds the emitted lines and the monotonic
/// counters behind fresh temp/label names, so nothing here is global
/// state; one session compiles one program.
pub struct Compiler {
    lines: Vec<String>,
    indent: String,
    var_count: usize,
    label_count: usize,
    func_args: FxHashSet<String>,
    in_function: bool,
    classes: FxHashMap<String, ClassInfo>,
    var_class: FxHashMap<String, String>,
}

pub fn compile(ast: &Node) -> Result<String, CompileError> {
    Compiler::new().compile(ast)
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            indent: String::new(),
            var_count: 0,
            label_count: 0,
            func_args: FxHashSet::default(),
            in_function: false,
            classes: FxHashMap::default(),
            var_class: FxHashMap::default(),
        }
    }

    pub fn compile(mut self, ast: &Node) -> Result<String, CompileError> {
        self.emit("/ ==== vee program ====");
        self.compile_node(ast)?;
        Ok(self.lines.join("\n"))
    }

    // -- emission helpers --

    fn emit(&mut self, line: impl AsRef<str>) {
        self.lines.push(format!("{}{}", self.indent, line.as_ref()));
    }

    fn increase_indent(&mut self) {
        self.indent.push(' ');
    }

    fn decrease_indent(&mut self) {
        self.indent.pop();
    }

    /// Fresh names are never reused, so nested constructs cannot collide.
    fn fresh_var(&mut self) -> String {
        self.var_count += 1;
        format!("__var{}", self.var_count)
    }

    fn fresh_label(&mut self) -> String {
        self.label_count += 1;
        format!("__lbl{}", self.label_count)
    }

    /// Some opcodes (`get`, `put`, `len`, `psh`) address their target
    /// through a variable reference; literals get bound to a temp first.
    fn as_var_ref(&mut self, operand: &str) -> String {
        if operand.starts_with('$') {
            operand.to_string()
        } else {
            let tmp = self.fresh_var();
            self.emit(format!("let {tmp} {operand}"));
            format!("${tmp}")
        }
    }

    fn ident_operand(&self, name: &str) -> String {
        if self.func_args.contains(name) {
            format!("$_{name}")
        } else {
            match name {
                "true" => "1".to_string(),
                "false" => "0".to_string(),
                "nil" => "$nil".to_string(),
                _ => format!("${name}"),
            }
        }
    }

    // -- node dispatch --

    fn compile_node(&mut self, node: &Node) -> Result<Option<String>, CompileError> {
        match node.kind {
            NodeKind::Value => Ok(Some(self.compile_value(node))),
            NodeKind::Ident => Ok(Some(self.ident_operand(node.text()))),
            NodeKind::Operator => self.compile_operator(node),
            NodeKind::ExprList => self.compile_collection(node).map(Some),
            NodeKind::StmtList => {
                let mut last = None;
                for child in &node.children {
                    last = self.compile_node(child)?;
                }
                Ok(last)
            }
            NodeKind::FuncCall => self.compile_call(node),
            NodeKind::FuncDef => {
                self.compile_func_def(node)?;
                Ok(None)
            }
            NodeKind::Return => {
                match node.children.first() {
                    Some(expr) => {
                        let value = self.compile_expr(expr)?;
                        self.emit(format!("ret {value}"));
                    }
                    None => self.emit("ret"),
                }
                Ok(None)
            }
            NodeKind::If => {
                self.compile_if(node)?;
                Ok(None)
            }
            NodeKind::While => {
                self.compile_while(node)?;
                Ok(None)
            }
            NodeKind::For => {
                self.compile_for(node)?;
                Ok(None)
            }
            NodeKind::Class => {
                self.compile_class(node)?;
                Ok(None)
            }
            NodeKind::Import => Err(CompileError::UnsupportedConstruct {
                construct: "import".to_string(),
                line: node.line(),
            }),
            NodeKind::ArgList => Err(CompileError::MalformedNode {
                kind: format!("{:?}", node.kind),
                line: node.line(),
            }),
        }
    }

    fn compile_expr(&mut self, node: &Node) -> Result<String, CompileError> {
        self.compile_node(node)?
            .ok_or(CompileError::ExpressionHasNoValue { line: node.line() })
    }

    fn compile_value(&mut self, node: &Node) -> String {
        let kind = node.token.as_ref().map(|token| token.kind);
        match kind {
            Some(TokenKind::Str) => quote(node.text()),
            _ => node.text().to_string(),
        }
    }

    // -- operators --

    fn compile_operator(&mut self, node: &Node) -> Result<Option<String>, CompileError> {
        let op = node.text().to_string();
        let line = node.line();
        if op == "=" {
            self.compile_assignment(node)?;
            return Ok(None);
        }
        if op == "." {
            return self.compile_member(node).map(Some);
        }

        let left = self.compile_expr(child(node, 0)?)?;
        let right = self.compile_expr(child(node, 1)?)?;
        let result = match op.as_str() {
            "+" => self.gen_op("add", &left, &right, None),
            "-" => self.gen_op("sub", &left, &right, None),
            "*" => self.gen_op("mul", &left, &right, None),
            "/" => self.gen_op("div", &left, &right, None),
            "%" => self.gen_op("mod", &left, &right, None),
            "<" => self.gen_compare("jlt", &left, &right),
            ">" => self.gen_compare("jgt", &left, &right),
            "==" => self.gen_compare("jeq", &left, &right),
            "!=" => self.gen_compare("jne", &left, &right),
            "<=" => {
                let strict = self.gen_compare("jlt", &left, &right);
                let equal = self.gen_compare("jeq", &left, &right);
                let sum = self.gen_op("add", &strict, &equal, None);
                self.gen_compare("jgt", &sum, "0")
            }
            ">=" => {
                let strict = self.gen_compare("jgt", &left, &right);
                let equal = self.gen_compare("jeq", &left, &right);
                let sum = self.gen_op("add", &strict, &equal, None);
                self.gen_compare("jgt", &sum, "0")
            }
            // Both operands are 0/1-valued comparison results, so AND is
            // "sum exceeds 1" and OR is "sum exceeds 0".
            "&&" => {
                let sum = self.gen_op("add", &left, &right, None);
                self.gen_compare("jgt", &sum, "1")
            }
            "||" => {
                let sum = self.gen_op("add", &left, &right, None);
                self.gen_compare("jgt", &sum, "0")
            }
            ".." => self.compile_range(&left, &right),
            "[" => {
                let receiver = self.as_var_ref(&left);
                self.gen_get(&receiver, &right)
            }
            _ => {
                return Err(CompileError::UnsupportedOperator { operator: op, line });
            }
        };
        Ok(Some(result))
    }

    fn compile_assignment(&mut self, node: &Node) -> Result<(), CompileError> {
        let target = child(node, 0)?;
        let value_node = child(node, 1)?;
        match target.kind {
            NodeKind::Ident => {
                let constructed = self.constructor_class_of(value_node);
                let value = self.compile_expr(value_node)?;
                let name = target.text();
                let slot = if self.func_args.contains(name) {
                    format!("_{name}")
                } else {
                    name.to_string()
                };
                self.emit(format!("let {slot} {value}"));
                match constructed {
                    Some(class) => {
                        self.var_class.insert(name.to_string(), class);
                    }
                    None => {
                        self.var_class.remove(name);
                    }
                }
                Ok(())
            }
            NodeKind::Operator if target.text() == "." => {
                let member = child(target, 1)?;
                if member.kind != NodeKind::Ident {
                    return Err(CompileError::InvalidAssignmentTarget { line: node.line() });
                }
                let field = quote(member.text());
                let receiver = self.compile_expr(child(target, 0)?)?;
                let receiver = self.as_var_ref(&receiver);
                let value = self.compile_expr(value_node)?;
                self.emit(format!("put {receiver} {field} {value}"));
                Ok(())
            }
            NodeKind::Operator if target.text() == "[" => {
                let receiver = self.compile_expr(child(target, 0)?)?;
                let receiver = self.as_var_ref(&receiver);
                let index = self.compile_expr(child(target, 1)?)?;
                let value = self.compile_expr(value_node)?;
                self.emit(format!("put {receiver} {index} {value}"));
                Ok(())
            }
            _ => Err(CompileError::InvalidAssignmentTarget { line: node.line() }),
        }
    }

    /// `value = ClassName(...)` is how the session learns a variable's
    /// class for later method-call resolution.
    fn constructor_class_of(&self, node: &Node) -> Option<String> {
        if node.kind == NodeKind::FuncCall && self.classes.contains_key(node.text()) {
            Some(node.text().to_string())
        } else {
            None
        }
    }

    fn compile_member(&mut self, node: &Node) -> Result<String, CompileError> {
        let receiver_node = child(node, 0)?;
        let member = child(node, 1)?;
        match member.kind {
            NodeKind::Ident => {
                let receiver = self.compile_expr(receiver_node)?;
                let receiver = self.as_var_ref(&receiver);
                if member.text() == "len" {
                    return Ok(self.gen_len(&receiver));
                }
                let field = quote(member.text());
                Ok(self.gen_get(&receiver, &field))
            }
            NodeKind::FuncCall => self.compile_method_call(receiver_node, member),
            _ => Err(CompileError::UnsupportedOperator {
                operator: ".".to_string(),
                line: node.line(),
            }),
        }
    }

    fn compile_method_call(
        &mut self,
        receiver_node: &Node,
        call: &Node,
    ) -> Result<String, CompileError> {
        let line = call.line();
        let method = call.text().to_string();
        let class_name = match receiver_node.kind {
            NodeKind::Ident => self.var_class.get(receiver_node.text()).cloned(),
            _ => None,
        }
        .ok_or_else(|| CompileError::UnknownReceiverClass {
            receiver: receiver_node.text().to_string(),
            line,
        })?;
        let known = self
            .classes
            .get(&class_name)
            .is_some_and(|class| class.method(&method).is_some());
        if !known {
            return Err(CompileError::UnknownMethod {
                class: class_name,
                method,
                line,
            });
        }

        let mut operands = vec![self.compile_expr(receiver_node)?];
        if let Some(args) = call.children.first() {
            for argument in &args.children {
                operands.push(self.compile_expr(argument)?);
            }
        }
        self.emit(format!("cal {class_name}:{method} {}", operands.join(" ")));
        let result = self.fresh_var();
        self.emit(format!("let {result} $ret"));
        Ok(format!("${result}"))
    }

    // -- expression code generators --

    fn gen_op(&mut self, opcode: &str, left: &str, right: &str, result: Option<String>) -> String {
        let var = result.unwrap_or_else(|| self.fresh_var());
        self.emit(format!("{opcode} {var} {left} {right}"));
        format!("${var}")
    }

    /// Comparisons bind a fresh temp to 0 or 1 through a conditional
    /// jump to a "true" label.
    fn gen_compare(&mut self, jump: &str, left: &str, right: &str) -> String {
        let result = self.fresh_var();
        let lbl_true = self.fresh_label();
        let lbl_end = self.fresh_label();
        self.emit(format!("{jump} {left} {right} {lbl_true}"));
        self.emit(format!("let {result} 0"));
        self.emit(format!("jmp {lbl_end}"));
        self.emit(format!("#{lbl_true}"));
        self.emit(format!("let {result} 1"));
        self.emit(format!("#{lbl_end}"));
        format!("${result}")
    }

    fn gen_get(&mut self, receiver: &str, key: &str) -> String {
        let result = self.fresh_var();
        self.emit(format!("get {receiver} {key} {result}"));
        format!("${result}")
    }

    fn gen_len(&mut self, receiver: &str) -> String {
        let result = self.fresh_var();
        self.emit(format!("len {receiver} {result}"));
        format!("${result}")
    }

    /// `a .. b` materializes the half-open range as a list built by an
    /// emitted counter loop.
    fn compile_range(&mut self, start: &str, end: &str) -> String {
        let list = self.fresh_var();
        let index = self.fresh_var();
        let lbl_start = self.fresh_label();
        let lbl_end = self.fresh_label();
        self.emit(format!("let {list} []"));
        self.emit(format!("let {index} {start}"));
        self.emit(format!("#{lbl_start}"));
        self.emit(format!("jeq ${index} {end} {lbl_end}"));
        self.emit(format!("psh ${list} ${index}"));
        self.emit(format!("add {index} ${index} 1"));
        self.emit(format!("jmp {lbl_start}"));
        self.emit(format!("#{lbl_end}"));
        format!("${list}")
    }

    fn compile_collection(&mut self, node: &Node) -> Result<String, CompileError> {
        match node.text() {
            "[" => {
                let list = self.fresh_var();
                self.emit(format!("let {list} []"));
                if !node.children.is_empty() {
                    let mut operands = Vec::with_capacity(node.children.len());
                    for element in &node.children {
                        operands.push(self.compile_expr(element)?);
                    }
                    self.emit(format!("psh ${list} {}", operands.join(" ")));
                }
                Ok(format!("${list}"))
            }
            "{" => {
                let map = self.fresh_var();
                self.emit(format!("let {map} {{}}"));
                for pair in &node.children {
                    let key = self.compile_expr(child(pair, 0)?)?;
                    let value = self.compile_expr(child(pair, 1)?)?;
                    self.emit(format!("put ${map} {key} {value}"));
                }
                Ok(format!("${map}"))
            }
            other => Err(CompileError::UnsupportedConstruct {
                construct: format!("expression list '{other}'"),
                line: node.line(),
            }),
        }
    }

    // -- calls --

    fn compile_call(&mut self, node: &Node) -> Result<Option<String>, CompileError> {
        let name = node.text().to_string();
        let line = node.line();
        let mut args = Vec::new();
        if let Some(list) = node.children.first() {
            for argument in &list.children {
                args.push(self.compile_expr(argument)?);
            }
        }

        let arity = |expected: std::ops::RangeInclusive<usize>| {
            if expected.contains(&args.len()) {
                Ok(())
            } else {
                Err(CompileError::UnsupportedConstruct {
                    construct: format!("{name} with {} arguments", args.len()),
                    line,
                })
            }
        };

        match name.as_str() {
            "print" => {
                arity(0..=2)?;
                match args.len() {
                    0 => self.emit("prt ''"),
                    1 => self.emit(format!("prt {}", args[0])),
                    _ => self.emit(format!("prt {} {}", args[0], args[1])),
                }
                Ok(None)
            }
            "sleep" => {
                arity(1..=1)?;
                self.emit(format!("slp {}", args[0]));
                Ok(None)
            }
            "input" => {
                arity(0..=0)?;
                let result = self.fresh_var();
                self.emit(format!("inp {result}"));
                Ok(Some(format!("${result}")))
            }
            "type" | "int" | "str" | "parse" => {
                arity(1..=1)?;
                let opcode = match name.as_str() {
                    "type" => "typ",
                    "parse" => "prs",
                    other => other,
                };
                let result = self.fresh_var();
                self.emit(format!("{opcode} {result} {}", args[0]));
                Ok(Some(format!("${result}")))
            }
            "len" => {
                arity(1..=1)?;
                let receiver = self.as_var_ref(&args[0]);
                Ok(Some(self.gen_len(&receiver)))
            }
            "random" => {
                arity(2..=2)?;
                let result = self.fresh_var();
                self.emit(format!("rnd {result} {} {}", args[0], args[1]));
                Ok(Some(format!("${result}")))
            }
            "time" => {
                arity(1..=1)?;
                let result = self.fresh_var();
                self.emit(format!("tim {result} {}", args[0]));
                Ok(Some(format!("${result}")))
            }
            _ => {
                self.emit(format!("cal {name} {}", args.join(" ")).trim_end().to_string());
                let result = self.fresh_var();
                self.emit(format!("let {result} $ret"));
                Ok(Some(format!("${result}")))
            }
        }
    }

    // -- statements --

    fn compile_if(&mut self, node: &Node) -> Result<(), CompileError> {
        let lbl_end_if = self.fresh_label();
        let pairs = node.children.len() / 2;
        for index in 0..pairs {
            let condition = self.compile_expr(&node.children[index * 2])?;
            let lbl_true = self.fresh_label();
            let lbl_false = self.fresh_label();
            self.emit(format!("jeq {condition} 1 {lbl_true}"));
            self.emit(format!("jmp {lbl_false}"));
            self.emit(format!("#{lbl_true}"));
            self.compile_node(&node.children[index * 2 + 1])?;
            self.emit(format!("jmp {lbl_end_if}"));
            self.emit(format!("#{lbl_false}"));
        }
        // Odd trailing child: the else body falls through to the end.
        if node.children.len() % 2 == 1 {
            self.compile_node(&node.children[node.children.len() - 1])?;
        }
        self.emit(format!("#{lbl_end_if}"));
        Ok(())
    }

    fn compile_while(&mut self, node: &Node) -> Result<(), CompileError> {
        let lbl_top = self.fresh_label();
        let lbl_body = self.fresh_label();
        let lbl_end = self.fresh_label();
        self.emit(format!("#{lbl_top}"));
        let condition = self.compile_expr(child(node, 0)?)?;
        self.emit(format!("jeq {condition} 1 {lbl_body}"));
        self.emit(format!("jmp {lbl_end}"));
        self.emit(format!("#{lbl_body}"));
        self.compile_node(child(node, 1)?)?;
        self.emit(format!("jmp {lbl_top}"));
        self.emit(format!("#{lbl_end}"));
        Ok(())
    }

    fn compile_for(&mut self, node: &Node) -> Result<(), CompileError> {
        let var = child(node, 0)?.text().to_string();
        let range = self.compile_expr(child(node, 1)?)?;
        self.emit(format!("for {var} {range}"));
        self.increase_indent();
        self.compile_node(child(node, 2)?)?;
        self.decrease_indent();
        self.emit("nxt");
        Ok(())
    }

    fn compile_func_def(&mut self, node: &Node) -> Result<(), CompileError> {
        if self.in_function {
            return Err(CompileError::NestedFunctionDefinition { line: node.line() });
        }
        let name = child(node, 0)?.text().to_string();
        let args: Vec<String> = child(node, 1)?
            .children
            .iter()
            .map(|arg| arg.text().to_string())
            .collect();
        self.gen_function(&name, &args, None, child(node, 2)?)
    }

    /// Emit one function: the `def` marker, one local binding per
    /// positional argument, the body, an implicit return of the body's
    /// trailing expression value (when there is one), and `end`.
    fn gen_function(
        &mut self,
        name: &str,
        args: &[String],
        method_of: Option<&str>,
        body: &Node,
    ) -> Result<(), CompileError> {
        self.in_function = true;
        self.func_args = args.iter().cloned().collect();
        let saved_classes = std::mem::take(&mut self.var_class);
        let offset = if let Some(class) = method_of {
            self.func_args.insert("this".to_string());
            self.var_class.insert("this".to_string(), class.to_string());
            1
        } else {
            0
        };

        self.emit(format!("def {name}"));
        self.increase_indent();
        if method_of.is_some() {
            self.emit("let _this $0");
        }
        for (index, arg) in args.iter().enumerate() {
            self.emit(format!("let _{arg} ${}", index + offset));
        }
        let last_value = self.compile_node(body)?;
        if let Some(value) = last_value {
            self.emit(format!("ret {value}"));
        }
        self.decrease_indent();
        self.emit("end");

        self.in_function = false;
        self.func_args.clear();
        self.var_class = saved_classes;
        Ok(())
    }

    // -- classes --

    fn compile_class(&mut self, node: &Node) -> Result<(), CompileError> {
        if self.in_function {
            return Err(CompileError::UnsupportedConstruct {
                construct: "class definition inside a function".to_string(),
                line: node.line(),
            });
        }
        let name = child(node, 0)?.text().to_string();
        let body = child(node, 1)?;

        let mut info = ClassInfo::default();
        for statement in &body.children {
            match statement.kind {
                NodeKind::Operator if statement.text() == "=" => {
                    let attr = child(statement, 0)?;
                    if attr.kind != NodeKind::Ident {
                        return Err(CompileError::InvalidAssignmentTarget {
                            line: statement.line(),
                        });
                    }
                    info.attributes
                        .push((attr.text().to_string(), child(statement, 1)?.clone()));
                }
                NodeKind::FuncDef => {
                    let method_name = child(statement, 0)?.text().to_string();
                    info.methods.push((method_name, statement.clone()));
                }
                _ => {
                    return Err(CompileError::UnsupportedConstruct {
                        construct: "statement in class body".to_string(),
                        line: statement.line(),
                    });
                }
            }
        }
        self.classes.insert(name.clone(), info.clone());

        self.gen_constructor(&name, &info)?;
        for (method_name, def) in &info.methods {
            let args: Vec<String> = child(def, 1)?
                .children
                .iter()
                .map(|arg| arg.text().to_string())
                .collect();
            let body = child(def, 2)?.clone();
            self.gen_function(&format!("{name}:{method_name}"), &args, Some(&name), &body)?;
        }
        Ok(())
    }

    /// The constructor builds the instance map, tags it with the hidden
    /// class discriminator, fills attribute defaults, forwards its
    /// positional arguments to `init` when the class declares one, and
    /// returns the instance.
    fn gen_constructor(&mut self, name: &str, info: &ClassInfo) -> Result<(), CompileError> {
        self.in_function = true;
        self.func_args.clear();
        let saved_classes = std::mem::take(&mut self.var_class);

        self.emit(format!("def {name}"));
        self.increase_indent();
        self.emit("let _self {}");
        self.emit(format!("put $_self '__class' '{name}'"));
        for (attribute, default) in &info.attributes {
            let value = self.compile_expr(default)?;
            self.emit(format!("put $_self '{attribute}' {value}"));
        }
        if let Some(arity) = info.init_arity() {
            let mut operands = vec!["$_self".to_string()];
            for index in 0..arity {
                operands.push(format!("${index}"));
            }
            self.emit(format!("cal {name}:init {}", operands.join(" ")));
        }
        self.emit("ret $_self");
        self.decrease_indent();
        self.emit("end");

        self.in_function = false;
        self.var_class = saved_classes;
        Ok(())
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

fn child(node: &Node, index: usize) -> Result<&Node, CompileError> {
    node.children
        .get(index)
        .ok_or_else(|| CompileError::MalformedNode {
            kind: format!("{:?}", node.kind),
            line: node.line(),
        })
}

/// Quote and re-escape a string operand for the instruction text.
fn quote(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    for c in text.chars() {
        match c {
            '\u{8}' => escaped.push_str("\\b"),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            '\'' => escaped.push_str("\\'"),
            _ => escaped.push(c),
        }
    }
    format!("'{escaped}'")
}
