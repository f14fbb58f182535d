use std::fmt;

#[derive(Debug, PartialEq, Clone)]
pub enum Token {
    Eof,
    Def,
    Extern,
    Ident(String),
    Number(f64),
    Operator(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Eof => write!(f, "end of input"),
            Token::Def => write!(f, "'def'"),
            Token::Extern => write!(f, "'extern'"),
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::Number(value) => write!(f, "number {}", value),
            Token::Operator(op) => write!(f, "'{}'", op),
        }
    }
}

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum LexError {
    #[error("malformed number literal '{0}'")]
    MalformedNumber(String),
}

/// Pull lexer over a stream of characters.
///
/// `last` is the single character of pushback: the first character that did
/// not belong to the previous token. `None` means the stream is exhausted.
pub struct Lexer<I> {
    chars: I,
    last: Option<char>,
    done: bool,
}

impl<I: Iterator<Item = char>> Lexer<I> {
    pub fn new(chars: I) -> Self {
        // primed with whitespace so nothing is read until the first pull
        Lexer {
            chars,
            last: Some(' '),
            done: false,
        }
    }

    fn bump(&mut self) {
        self.last = self.chars.next();
    }

    fn collect_while<P>(&mut self, pred: P) -> String
    where
        P: Fn(char) -> bool,
    {
        let mut text = String::new();
        while let Some(c) = self.last.filter(|&c| pred(c)) {
            text.push(c);
            self.bump();
        }
        text
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        loop {
            while self.last.map_or(false, char::is_whitespace) {
                self.bump();
            }

            let c = match self.last {
                Some(c) => c,
                None => return Ok(Token::Eof),
            };

            if c.is_ascii_alphabetic() {
                let ident = self.collect_while(|c| c.is_ascii_alphanumeric());
                return Ok(match ident.as_str() {
                    "def" => Token::Def,
                    "extern" => Token::Extern,
                    _ => Token::Ident(ident),
                });
            }

            if c.is_ascii_digit() || c == '.' {
                let text = self.collect_while(|c| c.is_ascii_digit() || c == '.');
                return match text.parse() {
                    Ok(value) => Ok(Token::Number(value)),
                    Err(_) => Err(LexError::MalformedNumber(text)),
                };
            }

            if c == '#' {
                while !matches!(self.last, None | Some('\n') | Some('\r')) {
                    self.bump();
                }
                continue;
            }

            self.bump();
            return Ok(Token::Operator(c));
        }
    }
}

/// Yields every token up to, but not including, `Token::Eof`.
impl<I: Iterator<Item = char>> Iterator for Lexer<I> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_token() {
            Ok(Token::Eof) => {
                self.done = true;
                None
            }
            tok => Some(tok),
        }
    }
}
