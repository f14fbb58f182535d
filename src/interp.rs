use std::collections::HashMap;
use std::io::Write;

use lazy_static::lazy_static;

use crate::ir::{Flag, FuncId, Inst, Module, Operand};

/// Without control flow every recursive call is unbounded.
pub const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum ExecError {
    #[error("call to a function that was removed from the module")]
    MissingFunction,
    #[error("extern {0} has no definition")]
    UnresolvedExtern(String),
    #[error("{name} takes {expected} argument(s), found {found}")]
    BuiltinArity {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("call depth limit exceeded while evaluating {0}")]
    StackOverflow(String),
    #[error("{0} fell off the end of its body")]
    MissingReturn(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[derive(Clone, Copy)]
enum Builtin {
    Unary(fn(f64) -> f64),
    Binary(fn(f64, f64) -> f64),
    PutChar,
    PrintDouble,
}

impl Builtin {
    fn arity(self) -> usize {
        match self {
            Builtin::Binary(_) => 2,
            _ => 1,
        }
    }
}

lazy_static! {
    static ref BUILTINS: HashMap<&'static str, Builtin> = {
        let mut builtins = HashMap::new();
        builtins.insert("sin", Builtin::Unary(f64::sin));
        builtins.insert("cos", Builtin::Unary(f64::cos));
        builtins.insert("tan", Builtin::Unary(f64::tan));
        builtins.insert("sqrt", Builtin::Unary(f64::sqrt));
        builtins.insert("exp", Builtin::Unary(f64::exp));
        builtins.insert("log", Builtin::Unary(f64::ln));
        builtins.insert("fabs", Builtin::Unary(f64::abs));
        builtins.insert("floor", Builtin::Unary(f64::floor));
        builtins.insert("ceil", Builtin::Unary(f64::ceil));
        builtins.insert("pow", Builtin::Binary(f64::powf));
        builtins.insert("putchard", Builtin::PutChar);
        builtins.insert("printd", Builtin::PrintDouble);
        builtins
    };
}

/// Tree-walking evaluator for functions in an [`ir::Module`](crate::ir::Module).
///
/// Body-less declarations resolve to the builtin table; `putchard` and
/// `printd` write to `out`.
pub struct Interpreter<'m, W> {
    module: &'m Module,
    out: W,
    depth: usize,
}

impl<'m, W: Write> Interpreter<'m, W> {
    pub fn new(module: &'m Module, out: W) -> Self {
        Interpreter {
            module,
            out,
            depth: 0,
        }
    }

    pub fn call(&mut self, id: FuncId, args: &[f64]) -> Result<f64, ExecError> {
        let module = self.module;
        let func = module.function(id).ok_or(ExecError::MissingFunction)?;
        let body = match &func.body {
            Some(body) => body,
            None => return self.call_builtin(&func.name, args),
        };

        if self.depth >= MAX_CALL_DEPTH {
            return Err(ExecError::StackOverflow(func.name.clone()));
        }
        self.depth += 1;
        let res = self.eval(body, args);
        self.depth -= 1;

        res?.ok_or_else(|| ExecError::MissingReturn(func.name.clone()))
    }

    fn eval(&mut self, body: &[Inst], args: &[f64]) -> Result<Option<f64>, ExecError> {
        let mut temps: Vec<f64> = Vec::with_capacity(body.len());
        let operand = |op: &Operand, temps: &[f64]| -> f64 {
            match *op {
                Operand::Const(value) => value,
                Operand::Param(i) => args.get(i).copied().unwrap_or(f64::NAN),
                Operand::Temp(t) => temps.get(t).copied().unwrap_or(f64::NAN),
            }
        };

        for inst in body {
            let value = match inst {
                Inst::Arith { op, lhs, rhs } => {
                    op.apply(operand(lhs, &temps[..]), operand(rhs, &temps[..]))
                }
                Inst::LessThan { lhs, rhs } => {
                    let (a, b) = (operand(lhs, &temps[..]), operand(rhs, &temps[..]));
                    if a < b || a.is_nan() || b.is_nan() {
                        1.0
                    } else {
                        0.0
                    }
                }
                Inst::Widen(Flag(flag)) => operand(flag, &temps[..]),
                Inst::Call {
                    callee,
                    args: call_args,
                } => {
                    let values: Vec<f64> =
                        call_args.iter().map(|a| operand(a, &temps[..])).collect();
                    self.call(*callee, &values)?
                }
                Inst::Ret(value) => return Ok(Some(operand(value, &temps[..]))),
                Inst::Nop => f64::NAN,
            };
            temps.push(value);
        }

        Ok(None)
    }

    fn call_builtin(&mut self, name: &str, args: &[f64]) -> Result<f64, ExecError> {
        let builtin = match BUILTINS.get(name) {
            Some(&builtin) => builtin,
            None => return Err(ExecError::UnresolvedExtern(name.to_string())),
        };
        if builtin.arity() != args.len() {
            return Err(ExecError::BuiltinArity {
                name: name.to_string(),
                expected: builtin.arity(),
                found: args.len(),
            });
        }

        match builtin {
            Builtin::Unary(f) => Ok(f(args[0])),
            Builtin::Binary(f) => Ok(f(args[0], args[1])),
            Builtin::PutChar => {
                let byte = args[0] as u8;
                self.out
                    .write_all(&[byte])
                    .map_err(|e| ExecError::Output(e.to_string()))?;
                Ok(0.0)
            }
            Builtin::PrintDouble => {
                writeln!(self.out, "{}", args[0]).map_err(|e| ExecError::Output(e.to_string()))?;
                Ok(0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{ArithOp, Backend};
    use test_case::test_case;

    fn module_with(name: &str, params: &[&str], body: Vec<Inst>) -> (Module, FuncId) {
        let mut module = Module::new("test");
        let params: Vec<String> = params.iter().map(|p| p.to_string()).collect();
        let id = module.declare_function(name, &params);
        module.begin_body(id);
        for inst in body {
            match inst {
                Inst::Arith { op, lhs, rhs } => {
                    module.build_arith(op, lhs, rhs);
                }
                Inst::Ret(op) => module.build_return(op),
                other => panic!("unsupported in helper: {:?}", other),
            }
        }
        (module, id)
    }

    #[test]
    fn evaluates_params() {
        let (module, id) = module_with(
            "sub",
            &["a", "b"],
            vec![
                Inst::Arith {
                    op: ArithOp::Sub,
                    lhs: Operand::Param(0),
                    rhs: Operand::Param(1),
                },
                Inst::Ret(Operand::Temp(0)),
            ],
        );
        let mut interp = Interpreter::new(&module, Vec::new());
        assert_eq!(interp.call(id, &[5.0, 3.0]), Ok(2.0));
    }

    #[test_case("sin", &[0.0], 0.0)]
    #[test_case("sqrt", &[16.0], 4.0)]
    #[test_case("pow", &[2.0, 10.0], 1024.0)]
    #[test_case("fabs", &[-3.5], 3.5)]
    fn builtins(name: &str, args: &[f64], expected: f64) {
        let mut module = Module::new("test");
        let params: Vec<String> = (0..args.len()).map(|i| format!("a{}", i)).collect();
        let id = module.declare_function(name, &params);
        let mut interp = Interpreter::new(&module, Vec::new());
        assert_eq!(interp.call(id, args), Ok(expected));
    }

    #[test]
    fn output_builtins_write_to_sink() {
        let mut module = Module::new("test");
        let putchard = module.declare_function("putchard", &["c".to_string()]);
        let printd = module.declare_function("printd", &["x".to_string()]);
        let mut out = Vec::new();
        {
            let mut interp = Interpreter::new(&module, &mut out);
            assert_eq!(interp.call(putchard, &[65.0]), Ok(0.0));
            assert_eq!(interp.call(printd, &[1.5]), Ok(0.0));
        }
        assert_eq!(String::from_utf8(out).unwrap(), "A1.5\n");
    }

    #[test]
    fn unknown_extern() {
        let mut module = Module::new("test");
        let id = module.declare_function("mystery", &[]);
        let mut interp = Interpreter::new(&module, Vec::new());
        assert_eq!(
            interp.call(id, &[]),
            Err(ExecError::UnresolvedExtern("mystery".to_string()))
        );
    }

    #[test]
    fn builtin_arity() {
        let mut module = Module::new("test");
        let id = module.declare_function("sin", &["a".to_string(), "b".to_string()]);
        let mut interp = Interpreter::new(&module, Vec::new());
        assert_eq!(
            interp.call(id, &[1.0, 2.0]),
            Err(ExecError::BuiltinArity {
                name: "sin".to_string(),
                expected: 1,
                found: 2
            })
        );
    }

    #[test]
    fn unbounded_recursion_is_caught() {
        let mut module = Module::new("test");
        let id = module.declare_function("loop", &["x".to_string()]);
        module.begin_body(id);
        let ret = module.build_call(id, &[Operand::Param(0)]);
        module.build_return(ret);

        let mut interp = Interpreter::new(&module, Vec::new());
        assert_eq!(
            interp.call(id, &[1.0]),
            Err(ExecError::StackOverflow("loop".to_string()))
        );
    }
}
