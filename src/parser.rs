use thiserror::Error;

use crate::ast::{Node, NodeKind};
use crate::token::{Token, TokenKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unexpected token {token}: expected {expected}")]
    UnexpectedToken { token: String, expected: String },
    #[error("Unexpected end of input: expected {expected}")]
    UnexpectedEnd { expected: String },
}

/// Two-character operators are assembled here from adjacent symbol
/// tokens; the lexer itself only ever emits one-character symbols.
const TWO_CHAR_OPERATORS: [&str; 7] = ["==", "!=", "<=", ">=", "&&", "||", ".."];

fn precedence(op: &str) -> Option<u8> {
    match op {
        "=" => Some(0),
        "&&" | "||" => Some(1),
        ".." | "==" | "!=" | "<" | "<=" | ">" | ">=" => Some(2),
        "+" | "-" => Some(3),
        "*" | "/" | "%" => Some(4),
        "." => Some(9),
        _ => None,
    }
}

fn is_left_associative(op: &str) -> bool {
    matches!(op, "+" | "-" | "*" | "/" | "%" | ".")
}

struct OperatorLookahead {
    text: String,
    precedence: u8,
    token_count: usize,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn parse(mut self) -> Result<Node, ParseError> {
        let root = self.parse_stmt_list()?;
        if self.peek().kind != TokenKind::Eof {
            return Err(self.unexpected("a statement"));
        }
        Ok(root)
    }

    fn parse_stmt_list(&mut self) -> Result<Node, ParseError> {
        let mut root = Node::without_token(NodeKind::StmtList);
        loop {
            match self.peek().kind {
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Keyword => root.children.push(self.parse_statement()?),
                TokenKind::Symbol if self.peek().text == "}" => break,
                _ => root.children.push(self.parse_expression(0)?),
            }
        }
        Ok(root)
    }

    fn parse_statement(&mut self) -> Result<Node, ParseError> {
        match self.peek().text.as_str() {
            "if" => self.parse_if(),
            "while" => {
                let keyword = self.advance();
                let mut node = Node::new(NodeKind::While, keyword);
                node.children.push(self.parse_expression(0)?);
                node.children.push(self.parse_block()?);
                Ok(node)
            }
            "for" => {
                let keyword = self.advance();
                let mut node = Node::new(NodeKind::For, keyword);
                let var = self.expect_kind(TokenKind::Identifier, "a loop variable")?;
                node.children.push(Node::new(NodeKind::Ident, var));
                self.expect_symbol(":")?;
                node.children.push(self.parse_expression(0)?);
                node.children.push(self.parse_block()?);
                Ok(node)
            }
            "func" => {
                let keyword = self.advance();
                let mut node = Node::new(NodeKind::FuncDef, keyword);
                let name = self.expect_kind(TokenKind::Identifier, "a function name")?;
                node.children.push(Node::new(NodeKind::Value, name));
                node.children.push(self.parse_args()?);
                node.children.push(self.parse_block()?);
                Ok(node)
            }
            "return" => {
                let keyword = self.advance();
                let mut node = Node::new(NodeKind::Return, keyword);
                let next = self.peek();
                let ends_statement = matches!(next.kind, TokenKind::Newline | TokenKind::Eof)
                    || next.is_symbol("}");
                if !ends_statement {
                    node.children.push(self.parse_expression(0)?);
                }
                Ok(node)
            }
            "class" => {
                let keyword = self.advance();
                let mut node = Node::new(NodeKind::Class, keyword);
                let name = self.expect_kind(TokenKind::Identifier, "a class name")?;
                node.children.push(Node::new(NodeKind::Value, name));
                node.children.push(self.parse_block()?);
                Ok(node)
            }
            "import" => {
                let keyword = self.advance();
                let mut node = Node::new(NodeKind::Import, keyword);
                let name = self.expect_kind(TokenKind::Identifier, "a module name")?;
                node.children.push(Node::new(NodeKind::Ident, name));
                Ok(node)
            }
            _ => Err(self.unexpected("a statement keyword")),
        }
    }

    /// `if` chains produce alternating condition/body children; a
    /// trailing `else` body, when present, is the final odd child.
    fn parse_if(&mut self) -> Result<Node, ParseError> {
        let keyword = self.advance();
        let mut node = Node::new(NodeKind::If, keyword);
        loop {
            node.children.push(self.parse_expression(0)?);
            node.children.push(self.parse_block()?);
            if !self.else_follows() {
                break;
            }
            self.advance(); // else
            if self.peek().is_keyword("if") {
                self.advance();
                continue;
            }
            node.children.push(self.parse_block()?);
            break;
        }
        Ok(node)
    }

    fn parse_block(&mut self) -> Result<Node, ParseError> {
        self.expect_symbol("{")?;
        let block = self.parse_stmt_list()?;
        self.expect_symbol("}")?;
        Ok(block)
    }

    fn parse_args(&mut self) -> Result<Node, ParseError> {
        let open = self.expect_symbol("(")?;
        let mut node = Node::new(NodeKind::ArgList, open);
        if !self.peek().is_symbol(")") {
            loop {
                let arg = self.expect_kind(TokenKind::Identifier, "an argument name")?;
                node.children.push(Node::new(NodeKind::Ident, arg));
                if !self.peek().is_symbol(",") {
                    break;
                }
                self.advance();
            }
        }
        self.expect_symbol(")")?;
        Ok(node)
    }

    fn parse_expression(&mut self, min_precedence: u8) -> Result<Node, ParseError> {
        while self.peek().kind == TokenKind::Newline {
            self.advance();
        }
        let mut node = self.parse_atom()?;
        while let Some(operator) = self.peek_operator() {
            if operator.precedence < min_precedence {
                break;
            }
            let first = self.advance();
            for _ in 1..operator.token_count {
                self.advance();
            }
            let op_token = Token::new(TokenKind::Symbol, operator.text, first.line, first.column);
            let next_min = if is_left_associative(&op_token.text) {
                operator.precedence + 1
            } else {
                operator.precedence
            };
            let right = self.parse_expression(next_min)?;
            let mut combined = Node::new(NodeKind::Operator, op_token);
            combined.children.push(node);
            combined.children.push(right);
            node = combined;
        }
        Ok(node)
    }

    fn parse_atom(&mut self) -> Result<Node, ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Number | TokenKind::Str => {
                self.advance();
                Ok(Node::new(NodeKind::Value, token))
            }
            TokenKind::Identifier => {
                self.advance();
                if self.peek().is_symbol("(") {
                    let args = self.parse_expression_list("(", ")")?;
                    let mut node = Node::new(NodeKind::FuncCall, token);
                    node.children.push(args);
                    return Ok(node);
                }
                let mut node = Node::new(NodeKind::Ident, token);
                while self.peek().is_symbol("[") {
                    let bracket = self.advance();
                    let index = self.parse_expression(0)?;
                    self.expect_symbol("]")?;
                    let mut indexed = Node::new(NodeKind::Operator, bracket);
                    indexed.children.push(node);
                    indexed.children.push(index);
                    node = indexed;
                }
                Ok(node)
            }
            TokenKind::Symbol if token.text == "(" => {
                self.advance();
                let node = self.parse_expression(0)?;
                self.expect_symbol(")")?;
                Ok(node)
            }
            TokenKind::Symbol if token.text == "[" => self.parse_expression_list("[", "]"),
            TokenKind::Symbol if token.text == "{" => self.parse_expression_list("{", "}"),
            TokenKind::Eof => Err(ParseError::UnexpectedEnd {
                expected: "an expression".to_string(),
            }),
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn parse_expression_list(&mut self, open: &str, close: &str) -> Result<Node, ParseError> {
        let open_token = self.expect_symbol(open)?;
        let mut node = Node::new(NodeKind::ExprList, open_token);
        loop {
            self.skip_newlines();
            if self.peek().is_symbol(close) {
                break;
            }
            if open == "{" {
                let key = self.parse_expression(0)?;
                let colon = self.expect_symbol(":")?;
                let value = self.parse_expression(0)?;
                let mut pair = Node::new(NodeKind::Operator, colon);
                pair.children.push(key);
                pair.children.push(value);
                node.children.push(pair);
            } else {
                node.children.push(self.parse_expression(0)?);
            }
            self.skip_newlines();
            if self.peek().is_symbol(",") {
                self.advance();
            }
        }
        self.expect_symbol(close)?;
        Ok(node)
    }

    /// Look at the upcoming token(s) as an infix operator, merging two
    /// adjacent one-character symbols (same line, touching columns) into
    /// the two-character operators the precedence table knows.
    fn peek_operator(&self) -> Option<OperatorLookahead> {
        let first = self.peek();
        if first.kind != TokenKind::Symbol {
            return None;
        }
        if let Some(second) = self.tokens.get(self.pos + 1)
            && second.kind == TokenKind::Symbol
            && second.line == first.line
            && second.column == first.column + 1
        {
            let merged = format!("{}{}", first.text, second.text);
            if TWO_CHAR_OPERATORS.contains(&merged.as_str()) {
                let precedence = precedence(&merged)?;
                return Some(OperatorLookahead {
                    text: merged,
                    precedence,
                    token_count: 2,
                });
            }
        }
        precedence(&first.text).map(|precedence| OperatorLookahead {
            text: first.text.clone(),
            precedence,
            token_count: 1,
        })
    }

    fn skip_newlines(&mut self) {
        while self.peek().kind == TokenKind::Newline {
            self.advance();
        }
    }

    /// True when the next non-newline token is `else`; consumes the
    /// intervening newlines only in that case.
    fn else_follows(&mut self) -> bool {
        let mut index = self.pos;
        while self
            .tokens
            .get(index)
            .is_some_and(|token| token.kind == TokenKind::Newline)
        {
            index += 1;
        }
        if self
            .tokens
            .get(index)
            .is_some_and(|token| token.is_keyword("else"))
        {
            self.pos = index;
            return true;
        }
        false
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .unwrap_or_else(|| self.tokens.last().expect("token stream ends with EOF"))
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect_kind(&mut self, kind: TokenKind, expected: &str) -> Result<Token, ParseError> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_symbol(&mut self, text: &str) -> Result<Token, ParseError> {
        if self.peek().is_symbol(text) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("'{text}'")))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::UnexpectedToken {
            token: self.peek().to_string(),
            expected: expected.to_string(),
        }
    }
}

pub fn parse(tokens: Vec<Token>) -> Result<Node, ParseError> {
    Parser::new(tokens).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use indoc::indoc;

    fn parse_source(source: &str) -> Node {
        parse(tokenize(source)).expect("parse failed")
    }

    fn operator(node: &Node) -> &str {
        assert_eq!(node.kind, NodeKind::Operator);
        node.text()
    }

    #[test]
    fn parses_assignment_and_arithmetic_precedence() {
        let root = parse_source("x = 1 + 2 * 3\n");
        assert_eq!(root.children.len(), 1);
        let assign = &root.children[0];
        assert_eq!(operator(assign), "=");
        assert_eq!(assign.children[0].text(), "x");
        let sum = &assign.children[1];
        assert_eq!(operator(sum), "+");
        assert_eq!(sum.children[0].text(), "1");
        assert_eq!(operator(&sum.children[1]), "*");
    }

    #[test]
    fn additive_operators_are_left_associative() {
        let root = parse_source("x = 10 - 4 - 3\n");
        let assign = &root.children[0];
        let outer = &assign.children[1];
        assert_eq!(operator(outer), "-");
        assert_eq!(operator(&outer.children[0]), "-");
        assert_eq!(outer.children[1].text(), "3");
    }

    #[test]
    fn merges_adjacent_symbols_into_comparison_operators() {
        let root = parse_source("r = a <= b\n");
        let assign = &root.children[0];
        assert_eq!(operator(&assign.children[1]), "<=");

        let root = parse_source("r = a < b && c == d\n");
        let assign = &root.children[0];
        let and = &assign.children[1];
        assert_eq!(operator(and), "&&");
        assert_eq!(operator(&and.children[0]), "<");
        assert_eq!(operator(&and.children[1]), "==");
    }

    #[test]
    fn spaced_symbols_do_not_merge() {
        // `a = = b` is an assignment whose right side fails to parse,
        // not an `==` comparison.
        let result = parse(tokenize("a = = b\n"));
        assert!(result.is_err());
    }

    #[test]
    fn parses_if_else_chain_into_alternating_children() {
        let source = indoc! {"
            if a == 1 {
                print('one')
            } else if a == 2 {
                print('two')
            } else {
                print('many')
            }
        "};
        let root = parse_source(source);
        let node = &root.children[0];
        assert_eq!(node.kind, NodeKind::If);
        // cond, body, cond, body, else-body
        assert_eq!(node.children.len(), 5);
        assert_eq!(operator(&node.children[0]), "==");
        assert_eq!(node.children[1].kind, NodeKind::StmtList);
        assert_eq!(node.children[4].kind, NodeKind::StmtList);
    }

    #[test]
    fn parses_for_and_while() {
        let source = indoc! {"
            for i : 0..5 {
                total = total + i
            }
            while total > 0 {
                total = total - 1
            }
        "};
        let root = parse_source(source);
        let for_node = &root.children[0];
        assert_eq!(for_node.kind, NodeKind::For);
        assert_eq!(for_node.children[0].text(), "i");
        assert_eq!(operator(&for_node.children[1]), "..");
        assert_eq!(for_node.children[2].kind, NodeKind::StmtList);

        let while_node = &root.children[1];
        assert_eq!(while_node.kind, NodeKind::While);
        assert_eq!(operator(&while_node.children[0]), ">");
    }

    #[test]
    fn parses_function_definition_and_call() {
        let source = indoc! {"
            func add(a, b) {
                return a + b
            }
            add(1, 2)
        "};
        let root = parse_source(source);
        let def = &root.children[0];
        assert_eq!(def.kind, NodeKind::FuncDef);
        assert_eq!(def.children[0].text(), "add");
        let args = &def.children[1];
        assert_eq!(args.kind, NodeKind::ArgList);
        assert_eq!(args.children.len(), 2);
        let body = &def.children[2];
        assert_eq!(body.children[0].kind, NodeKind::Return);

        let call = &root.children[1];
        assert_eq!(call.kind, NodeKind::FuncCall);
        assert_eq!(call.children[0].children.len(), 2);
    }

    #[test]
    fn parses_collection_literals() {
        let root = parse_source("x = [1, 2, 3]\ny = {'a': 1, 'b': 2}\nz = []\n");
        let list = &root.children[0].children[1];
        assert_eq!(list.kind, NodeKind::ExprList);
        assert_eq!(list.text(), "[");
        assert_eq!(list.children.len(), 3);

        let map = &root.children[1].children[1];
        assert_eq!(map.text(), "{");
        assert_eq!(map.children.len(), 2);
        let pair = &map.children[0];
        assert_eq!(operator(pair), ":");
        assert_eq!(pair.children[0].text(), "a");

        let empty = &root.children[2].children[1];
        assert!(empty.children.is_empty());
    }

    #[test]
    fn parses_member_access_method_call_and_indexing() {
        let root = parse_source("a = p.x\np.move(1, 2)\nb = items[0]\n");
        let member = &root.children[0].children[1];
        assert_eq!(operator(member), ".");
        assert_eq!(member.children[1].kind, NodeKind::Ident);

        let method = &root.children[1];
        assert_eq!(operator(method), ".");
        assert_eq!(method.children[1].kind, NodeKind::FuncCall);

        let index = &root.children[2].children[1];
        assert_eq!(operator(index), "[");
        assert_eq!(index.children[1].text(), "0");
    }

    #[test]
    fn parses_class_with_attributes_and_methods() {
        let source = indoc! {"
            class Point {
                x = 0
                y = 0
                func init(a, b) {
                    this.x = a
                    this.y = b
                }
                func sum() {
                    return this.x + this.y
                }
            }
        "};
        let root = parse_source(source);
        let class = &root.children[0];
        assert_eq!(class.kind, NodeKind::Class);
        assert_eq!(class.children[0].text(), "Point");
        let body = &class.children[1];
        assert_eq!(body.children.len(), 4);
        assert_eq!(body.children[2].kind, NodeKind::FuncDef);
    }

    #[test]
    fn parses_import_statement() {
        let root = parse_source("import display\n");
        let node = &root.children[0];
        assert_eq!(node.kind, NodeKind::Import);
        assert_eq!(node.children[0].text(), "display");
    }

    #[test]
    fn parse_errors_abort_immediately() {
        let err = parse(tokenize("func {\n")).expect_err("expected parse failure");
        assert!(err.to_string().contains("expected a function name"));

        let err = parse(tokenize("x = )\n")).expect_err("expected parse failure");
        assert!(err.to_string().contains("expected an expression"));

        let err = parse(tokenize("}\n")).expect_err("expected parse failure");
        assert!(err.to_string().contains("expected a statement"));
    }
}
