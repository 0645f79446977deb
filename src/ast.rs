use crate::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Value,
    Ident,
    Operator,
    ExprList,
    StmtList,
    FuncCall,
    FuncDef,
    ArgList,
    For,
    If,
    Return,
    Class,
    While,
    Import,
}

/// One AST node: a kind tag, the token it was built from, and an ordered
/// list of exclusively-owned children.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub token: Option<Token>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(kind: NodeKind, token: Token) -> Self {
        Self {
            kind,
            token: Some(token),
            children: Vec::new(),
        }
    }

    pub fn without_token(kind: NodeKind) -> Self {
        Self {
            kind,
            token: None,
            children: Vec::new(),
        }
    }

    /// Text of the underlying token, or `""` for synthesized nodes.
    pub fn text(&self) -> &str {
        self.token.as_ref().map_or("", |token| token.text.as_str())
    }

    /// 1-based source line of the underlying token, if known.
    pub fn line(&self) -> usize {
        self.token.as_ref().map_or(0, |token| token.line)
    }
}
