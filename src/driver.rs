use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::Display;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use crate::codegen::{Codegen, Execute};
use crate::lexer::{Lexer, Token};
use crate::parser::Parser;

/// Where a [`LineChars`] leaves the error that cut its input short.
pub type InputError = Rc<RefCell<Option<io::Error>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Options {
    pub emit_ir: bool,
    pub dump_ast: bool,
    /// Print a `ready> ` prompt before reading each unit.
    pub interactive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub units: usize,
    pub errors: usize,
}

/// Runs the top-level loop: parse one unit, lower it, and for bare
/// expressions run the result. A failing unit is reported on `err` and
/// skipped; the loop only stops at end of input or on an I/O error.
pub struct Driver<I, B: Execute, O, E> {
    parser: Parser<I>,
    pub codegen: Codegen<B>,
    options: Options,
    out: O,
    err: E,
    input_error: Option<InputError>,
    summary: SessionSummary,
}

impl<I, B, O, E> Driver<I, B, O, E>
where
    I: Iterator<Item = char>,
    B: Execute,
    O: Write,
    E: Write,
{
    pub fn new(parser: Parser<I>, codegen: Codegen<B>, options: Options, out: O, err: E) -> Self {
        Driver {
            parser,
            codegen,
            options,
            out,
            err,
            input_error: None,
            summary: SessionSummary::default(),
        }
    }

    /// Reports a read failure of the underlying input as a session error
    /// once the input has ended.
    pub fn watch_input(mut self, input_error: InputError) -> Self {
        self.input_error = Some(input_error);
        self
    }

    pub fn run(&mut self) -> anyhow::Result<SessionSummary> {
        self.prompt()?;
        self.skip()?;

        loop {
            match self.parser.current().clone() {
                Token::Eof => break,
                Token::Operator(';') => {
                    self.prompt()?;
                    self.skip()?;
                }
                Token::Def => self.handle_definition()?,
                Token::Extern => self.handle_extern()?,
                _ => self.handle_top_level_expr()?,
            }
        }

        if let Some(slot) = self.input_error.clone() {
            if let Some(err) = slot.borrow().as_ref() {
                self.report(&format!("failed to read input: {}", err))?;
            }
        }

        if self.options.emit_ir {
            write!(self.out, "{}", self.codegen.backend.print_ir())?;
        }
        self.out.flush()?;
        Ok(self.summary)
    }

    fn prompt(&mut self) -> anyhow::Result<()> {
        if self.options.interactive {
            write!(self.err, "ready> ")?;
            self.err.flush()?;
        }
        Ok(())
    }

    /// Moves past the current token. A token that fails to lex is reported
    /// and the one after it is tried instead.
    fn skip(&mut self) -> anyhow::Result<()> {
        while let Err(err) = self.parser.advance().map(|_| ()) {
            self.report(&err)?;
        }
        Ok(())
    }

    fn report(&mut self, err: &dyn Display) -> anyhow::Result<()> {
        self.summary.errors += 1;
        writeln!(self.err, "error: {}", err)?;
        Ok(())
    }

    fn handle_definition(&mut self) -> anyhow::Result<()> {
        self.summary.units += 1;
        let func = match self.parser.parse_definition() {
            Ok(func) => func,
            Err(err) => {
                self.report(&err)?;
                return self.skip();
            }
        };
        if self.options.dump_ast {
            writeln!(self.out, "{}", func)?;
        }

        match self.codegen.compile_fn(&func) {
            Ok(compiled) => {
                log::info!("defined {}", func.prototype);
                if self.options.emit_ir {
                    write!(self.out, "{}", self.codegen.backend.function_ir(compiled))?;
                }
                Ok(())
            }
            Err(err) => self.report(&err),
        }
    }

    fn handle_extern(&mut self) -> anyhow::Result<()> {
        self.summary.units += 1;
        let proto = match self.parser.parse_extern() {
            Ok(proto) => proto,
            Err(err) => {
                self.report(&err)?;
                return self.skip();
            }
        };
        if self.options.dump_ast {
            writeln!(self.out, "extern {}", proto)?;
        }

        match self.codegen.compile_proto(&proto) {
            Ok(declared) => {
                log::info!("declared extern {}", proto);
                if self.options.emit_ir {
                    write!(self.out, "{}", self.codegen.backend.function_ir(declared))?;
                }
                Ok(())
            }
            Err(err) => self.report(&err),
        }
    }

    fn handle_top_level_expr(&mut self) -> anyhow::Result<()> {
        self.summary.units += 1;
        let func = match self.parser.parse_top_level_expr() {
            Ok(func) => func,
            Err(err) => {
                self.report(&err)?;
                return self.skip();
            }
        };
        if self.options.dump_ast {
            writeln!(self.out, "{}", func)?;
        }

        let compiled = match self.codegen.compile_fn(&func) {
            Ok(compiled) => compiled,
            Err(err) => return self.report(&err),
        };
        if self.options.emit_ir {
            write!(self.out, "{}", self.codegen.backend.function_ir(compiled))?;
        }

        let result = self.codegen.backend.execute(compiled);
        self.codegen.backend.remove_function(compiled);
        match result {
            Ok(value) => {
                log::info!("evaluated {}", func.body);
                writeln!(self.out, "Evaluated to {}", value)?;
                Ok(())
            }
            Err(err) => self.report(&err),
        }
    }
}

/// Character stream over a buffered reader, pulled one line at a time so an
/// interactive session only blocks when the parser actually needs more input.
/// A read error ends the stream; it is kept in [`LineChars::error_slot`].
pub struct LineChars<R> {
    reader: R,
    pending: VecDeque<char>,
    error: InputError,
    done: bool,
}

impl<R: BufRead> LineChars<R> {
    pub fn new(reader: R) -> Self {
        LineChars {
            reader,
            pending: VecDeque::new(),
            error: InputError::default(),
            done: false,
        }
    }

    pub fn error_slot(&self) -> InputError {
        Rc::clone(&self.error)
    }
}

impl<R: BufRead> Iterator for LineChars<R> {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        loop {
            if let Some(c) = self.pending.pop_front() {
                return Some(c);
            }
            if self.done {
                return None;
            }
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => self.done = true,
                Ok(_) => self.pending.extend(line.chars()),
                Err(err) => {
                    log::debug!("input ended by read error: {}", err);
                    *self.error.borrow_mut() = Some(err);
                    self.done = true;
                }
            }
        }
    }
}

/// Writes every token of `text`, one per line, with lex errors in place.
pub fn dump_tokens<W: Write>(text: &str, out: &mut W) -> io::Result<()> {
    for token in Lexer::new(text.chars()) {
        match token {
            Ok(token) => writeln!(out, "{:?}", token)?,
            Err(err) => writeln!(out, "error: {}", err)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Module;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    struct Session {
        out: String,
        err: String,
        summary: SessionSummary,
    }

    fn session(source: &str, options: Options) -> Session {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let summary = {
            let mut driver = Driver::new(
                Parser::new(source.chars()),
                Codegen::new(Module::new("test")),
                options,
                &mut out,
                &mut err,
            );
            driver.run().unwrap()
        };
        Session {
            out: String::from_utf8(out).unwrap(),
            err: String::from_utf8(err).unwrap(),
            summary,
        }
    }

    fn run(source: &str) -> Session {
        session(source, Options::default())
    }

    #[test]
    fn evaluates_top_level_expressions() {
        let s = run("def double(x) x * 2; double(21); 1 + 2 * 3;");
        assert_eq!(s.out, "Evaluated to 42\nEvaluated to 7\n");
        assert_eq!(s.err, "");
        assert_eq!(s.summary, SessionSummary { units: 3, errors: 0 });
    }

    #[test]
    fn calls_builtin_externs() {
        let s = run("extern sqrt(x); sqrt(16);");
        assert_eq!(s.out, "Evaluated to 4\n");
    }

    #[test]
    fn recovers_from_syntax_errors() {
        let s = run("def 1; 4;");
        assert_eq!(
            s.err,
            "error: expected function name in prototype, found number 1\n"
        );
        assert_eq!(s.out, "Evaluated to 4\n");
        assert_eq!(s.summary.errors, 1);
    }

    #[test]
    fn recovers_from_unknown_tokens() {
        let s = run(") 5;");
        assert_eq!(
            s.err,
            "error: unknown token when expecting an expression, found ')'\n"
        );
        assert_eq!(s.out, "Evaluated to 5\n");
    }

    #[test]
    fn malformed_numbers_are_recoverable() {
        let s = run("1..2; 3; 1 + 2.3.4; 5;");
        assert_eq!(s.summary.errors, 2);
        assert!(s.err.contains("malformed number literal '1..2'"));
        assert!(s.err.contains("malformed number literal '2.3.4'"));
        assert_eq!(s.out, "Evaluated to 3\nEvaluated to 5\n");
    }

    #[test]
    fn lowering_errors_abandon_only_the_unit() {
        let s = run("def g(x) x; def g(x) x + 1; g(1); nope(2); g(1, 2); y;");
        assert_eq!(
            s.err,
            "error: function g cannot be redefined\n\
             error: unknown function referenced nope\n\
             error: incorrect number of arguments for g: expected 1, found 2\n\
             error: unknown variable referenced y\n"
        );
        assert_eq!(s.out, "Evaluated to 1\n");
        assert_eq!(s.summary, SessionSummary { units: 6, errors: 4 });
    }

    #[test]
    fn anonymous_functions_are_removed() {
        let s = session(
            "def f(x) x; 1; 2;",
            Options {
                emit_ir: true,
                ..Options::default()
            },
        );
        assert!(s.out.ends_with(
            "; ModuleID = 'test'\n\ndefine double @f(double %x) {\nentry:\n  ret double %x\n}\n"
        ));
        assert_eq!(s.out.matches("Evaluated to").count(), 2);
    }

    #[test]
    fn execution_errors_are_reported() {
        let s = run("extern mystery(); mystery();");
        assert_eq!(s.err, "error: extern mystery has no definition\n");
        assert_eq!(s.out, "");
    }

    #[test]
    fn dumps_ast() {
        let s = session(
            "extern sin(a); def f(x y) x + y * 2",
            Options {
                dump_ast: true,
                ..Options::default()
            },
        );
        assert_eq!(s.out, "extern sin(a)\ndef f(x y) (+ x (* y 2))\n");
    }

    #[test]
    fn prompts_when_interactive() {
        let s = session(
            "1;",
            Options {
                interactive: true,
                ..Options::default()
            },
        );
        assert_eq!(s.err, "ready> ready> ");
    }

    #[test]
    fn comments_and_empty_units() {
        let s = run("# nothing here\n;;; 2 # two\n;");
        assert_eq!(s.out, "Evaluated to 2\n");
        assert_eq!(s.summary.units, 1);
    }

    #[test]
    fn read_errors_are_reported() {
        let chars = LineChars::new(Cursor::new(b"1;\n\xff\xfe;\n2;\n".to_vec()));
        let slot = chars.error_slot();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let summary = Driver::new(
            Parser::new(chars),
            Codegen::new(Module::new("test")),
            Options::default(),
            &mut out,
            &mut err,
        )
        .watch_input(slot.clone())
        .run()
        .unwrap();

        assert!(slot.borrow().is_some());
        assert_eq!(String::from_utf8(out).unwrap(), "Evaluated to 1\n");
        let err = String::from_utf8(err).unwrap();
        assert!(err.starts_with("error: failed to read input: "));
        assert_eq!(err.lines().count(), 1);
        assert_eq!(summary, SessionSummary { units: 1, errors: 1 });
    }

    #[test]
    fn clean_input_leaves_slot_empty() {
        let mut chars = LineChars::new(Cursor::new("1;\n"));
        let slot = chars.error_slot();
        assert_eq!(chars.by_ref().count(), 3);
        assert!(slot.borrow().is_none());
    }

    #[test]
    fn dumps_tokens_and_lex_errors() {
        let source = "def f(x) x + 2.3.4; 2;";
        let mut out = Vec::new();
        dump_tokens(source, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Def\n\
             Ident(\"f\")\n\
             Operator('(')\n\
             Ident(\"x\")\n\
             Operator(')')\n\
             Ident(\"x\")\n\
             Operator('+')\n\
             error: malformed number literal '2.3.4'\n\
             Operator(';')\n\
             Number(2.0)\n\
             Operator(';')\n"
        );

        let s = run(source);
        assert_eq!(s.out, "Evaluated to 2\n");
        assert_eq!(s.summary, SessionSummary { units: 2, errors: 1 });
    }

    #[test]
    fn line_chars_reads_everything() {
        let chars: String = LineChars::new(Cursor::new("def f(x)\n  x;\n")).collect();
        assert_eq!(chars, "def f(x)\n  x;\n");
    }
}
