use std::collections::HashMap;

use crate::ast::{Expression, Function, Prototype};
use crate::lexer::{LexError, Lexer, Token};

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum ParserError {
    #[error("expected {expected}, found {found}")]
    UnexpectedToken {
        expected: &'static str,
        found: Token,
    },
    #[error("unknown token when expecting an expression, found {0}")]
    ExpectedExpression(Token),
    #[error(transparent)]
    Lex(#[from] LexError),
}

pub type ParseResult<T> = Result<T, ParserError>;
pub type PartialParseResult = ParseResult<Expression>;

fn unexpected<T>(expected: &'static str, found: &Token) -> ParseResult<T> {
    Err(ParserError::UnexpectedToken {
        expected,
        found: found.clone(),
    })
}

/// Binding powers of the binary operators; higher binds tighter.
fn default_precedence() -> HashMap<char, i32> {
    let mut operator_precedence = HashMap::new();
    operator_precedence.insert('<', 10);
    operator_precedence.insert('+', 20);
    operator_precedence.insert('-', 20);
    operator_precedence.insert('*', 40);
    operator_precedence
}

/// Recursive descent parser with a single token of lookahead.
///
/// The parser starts without a current token; call [`Parser::advance`] once
/// before parsing the first unit.
pub struct Parser<I> {
    lexer: Lexer<I>,
    current: Token,
    operator_precedence: HashMap<char, i32>,
}

impl<I: Iterator<Item = char>> Parser<I> {
    pub fn new(chars: I) -> Self {
        Parser {
            lexer: Lexer::new(chars),
            current: Token::Eof,
            operator_precedence: default_precedence(),
        }
    }

    pub fn current(&self) -> &Token {
        &self.current
    }

    pub fn advance(&mut self) -> ParseResult<&Token> {
        self.current = self.lexer.next_token()?;
        log::trace!("token {}", self.current);
        Ok(&self.current)
    }

    fn token_precedence(&self) -> i32 {
        match self.current {
            Token::Operator(op) => self.operator_precedence.get(&op).copied().unwrap_or(-1),
            _ => -1,
        }
    }

    fn expect_operator(&mut self, op: char, expected: &'static str) -> ParseResult<()> {
        if self.current != Token::Operator(op) {
            return unexpected(expected, &self.current);
        }
        self.advance()?;
        Ok(())
    }

    fn parse_number(&mut self, value: f64) -> PartialParseResult {
        self.advance()?;
        Ok(Expression::Literal(value))
    }

    fn parse_nested(&mut self) -> PartialParseResult {
        self.expect_operator('(', "'('")?;
        let res = self.parse_expr()?;
        self.expect_operator(')', "')'")?;
        Ok(res)
    }

    fn parse_identifier(&mut self) -> PartialParseResult {
        let ident = match &self.current {
            Token::Ident(ident) => ident.clone(),
            tok => return unexpected("identifier", tok),
        };
        self.advance()?;

        if self.current != Token::Operator('(') {
            return Ok(Expression::Variable(ident));
        }
        self.advance()?;

        let mut args = Vec::new();
        if self.current != Token::Operator(')') {
            loop {
                args.push(self.parse_expr()?);
                match self.current {
                    Token::Operator(')') => break,
                    Token::Operator(',') => {
                        self.advance()?;
                    }
                    ref tok => return unexpected("')' or ',' in argument list", tok),
                }
            }
        }
        self.advance()?;

        Ok(Expression::Call(ident, args))
    }

    fn parse_primary(&mut self) -> PartialParseResult {
        match self.current {
            Token::Number(value) => self.parse_number(value),
            Token::Ident(_) => self.parse_identifier(),
            Token::Operator('(') => self.parse_nested(),
            ref tok => Err(ParserError::ExpectedExpression(tok.clone())),
        }
    }

    fn parse_rhs(&mut self, expr_precedence: i32, lhs: Expression) -> PartialParseResult {
        let mut result = lhs;

        loop {
            let precedence = self.token_precedence();
            if precedence < expr_precedence {
                return Ok(result);
            }
            let operator = match self.current {
                Token::Operator(op) => op,
                _ => return Ok(result),
            };
            self.advance()?;

            let mut rhs = self.parse_primary()?;

            if precedence < self.token_precedence() {
                rhs = self.parse_rhs(precedence + 1, rhs)?;
            }

            result = Expression::binary(operator, result, rhs);
        }
    }

    pub fn parse_expr(&mut self) -> PartialParseResult {
        let lhs = self.parse_primary()?;
        self.parse_rhs(0, lhs)
    }

    pub fn parse_prototype(&mut self) -> ParseResult<Prototype> {
        let name = match &self.current {
            Token::Ident(name) => name.clone(),
            tok => return unexpected("function name in prototype", tok),
        };
        self.advance()?;

        if self.current != Token::Operator('(') {
            return unexpected("'(' in prototype", &self.current);
        }

        let mut args = Vec::new();
        while let Token::Ident(arg) = self.advance()? {
            args.push(arg.clone());
        }

        self.expect_operator(')', "')' in prototype")?;

        Ok(Prototype::new(name, args))
    }

    /// definition ::= 'def' prototype expression
    pub fn parse_definition(&mut self) -> ParseResult<Function> {
        if self.current != Token::Def {
            return unexpected("'def'", &self.current);
        }
        self.advance()?;
        let prototype = self.parse_prototype()?;
        let body = self.parse_expr()?;
        log::debug!("parsed definition of {}", prototype);
        Ok(Function { prototype, body })
    }

    /// extern ::= 'extern' prototype
    pub fn parse_extern(&mut self) -> ParseResult<Prototype> {
        if self.current != Token::Extern {
            return unexpected("'extern'", &self.current);
        }
        self.advance()?;
        let prototype = self.parse_prototype()?;
        log::debug!("parsed extern {}", prototype);
        Ok(prototype)
    }

    pub fn parse_top_level_expr(&mut self) -> ParseResult<Function> {
        let body = self.parse_expr()?;
        log::debug!("parsed top-level expression {}", body);
        Ok(Function::anonymous(body))
    }
}
