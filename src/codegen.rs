use std::collections::HashMap;

use crate::ast::{Expression, Function, Prototype};

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum CodegenError {
    #[error("unknown variable referenced {0}")]
    UnknownVariable(String),
    #[error("invalid binary operator {0}")]
    InvalidOperator(char),
    #[error("unknown function referenced {0}")]
    UnknownFunction(String),
    #[error("incorrect number of arguments for {callee}: expected {expected}, found {found}")]
    ArityMismatch {
        callee: String,
        expected: usize,
        found: usize,
    },
    #[error("function {0} cannot be redefined")]
    Redefinition(String),
    #[error("failed to verify function {0}")]
    InvalidFunction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn from_char(op: char) -> Option<ArithOp> {
        match op {
            '+' => Some(ArithOp::Add),
            '-' => Some(ArithOp::Sub),
            '*' => Some(ArithOp::Mul),
            '/' => Some(ArithOp::Div),
            _ => None,
        }
    }

    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ArithOp::Add => lhs + rhs,
            ArithOp::Sub => lhs - rhs,
            ArithOp::Mul => lhs * rhs,
            ArithOp::Div => lhs / rhs,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            ArithOp::Add => "fadd",
            ArithOp::Sub => "fsub",
            ArithOp::Mul => "fmul",
            ArithOp::Div => "fdiv",
        }
    }
}

/// Code generation capability the dispatcher lowers into.
///
/// Every value is a double; `Flag` is the one-bit result of a comparison and
/// has to be widened before it can be used as a value again. Instruction
/// builders append at the insertion point set by [`Backend::begin_body`].
pub trait Backend {
    type Value: Copy;
    type Flag: Copy;
    type Function: Copy + PartialEq;

    fn const_float(&mut self, value: f64) -> Self::Value;
    fn build_arith(&mut self, op: ArithOp, lhs: Self::Value, rhs: Self::Value) -> Self::Value;
    fn build_less_than(&mut self, lhs: Self::Value, rhs: Self::Value) -> Self::Flag;
    fn widen(&mut self, flag: Self::Flag) -> Self::Value;
    fn build_call(&mut self, callee: Self::Function, args: &[Self::Value]) -> Self::Value;
    fn build_return(&mut self, value: Self::Value);

    fn get_function(&self, name: &str) -> Option<Self::Function>;
    fn param_count(&self, function: Self::Function) -> usize;
    fn has_body(&self, function: Self::Function) -> bool;
    fn declare_function(&mut self, name: &str, params: &[String]) -> Self::Function;
    /// Parameter names as given when the function was declared.
    fn param_names(&self, function: Self::Function) -> Vec<String>;
    fn params(&self, function: Self::Function) -> Vec<Self::Value>;
    fn begin_body(&mut self, function: Self::Function);
    /// Drops the body, leaving a declaration behind.
    fn clear_body(&mut self, function: Self::Function);
    fn remove_function(&mut self, function: Self::Function);

    fn verify(&self, function: Self::Function) -> bool;
    fn optimize(&mut self, function: Self::Function);

    fn function_ir(&self, function: Self::Function) -> String;
    fn print_ir(&self) -> String;
}

/// Backends that can run a zero-parameter function and hand back its result.
pub trait Execute: Backend {
    type Error: std::error::Error + Send + Sync + 'static;

    fn execute(&mut self, function: Self::Function) -> Result<f64, Self::Error>;
}

pub type CodegenResult<T> = Result<T, CodegenError>;

pub struct Codegen<B: Backend> {
    pub backend: B,
    pub named_values: HashMap<String, B::Value>,
    optimize: bool,
}

impl<B: Backend> Codegen<B> {
    pub fn new(backend: B) -> Self {
        Codegen {
            backend,
            named_values: HashMap::new(),
            optimize: true,
        }
    }

    pub fn with_optimization(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    fn codegen_expr(&mut self, expr: &Expression) -> CodegenResult<B::Value> {
        match expr {
            Expression::Literal(value) => Ok(self.backend.const_float(*value)),
            Expression::Variable(name) => match self.named_values.get(name) {
                Some(&var) => Ok(var),
                None => Err(CodegenError::UnknownVariable(name.clone())),
            },
            Expression::Binary(op, left, right) => {
                let lhs = self.codegen_expr(left)?;
                let rhs = self.codegen_expr(right)?;

                if *op == '<' {
                    let cmp = self.backend.build_less_than(lhs, rhs);
                    return Ok(self.backend.widen(cmp));
                }
                match ArithOp::from_char(*op) {
                    Some(arith) => Ok(self.backend.build_arith(arith, lhs, rhs)),
                    None => Err(CodegenError::InvalidOperator(*op)),
                }
            }
            Expression::Call(callee, args) => {
                let func = match self.backend.get_function(callee) {
                    Some(func) => func,
                    None => return Err(CodegenError::UnknownFunction(callee.clone())),
                };

                let expected = self.backend.param_count(func);
                if expected != args.len() {
                    return Err(CodegenError::ArityMismatch {
                        callee: callee.clone(),
                        expected,
                        found: args.len(),
                    });
                }

                let mut gened_args = Vec::with_capacity(args.len());
                for arg in args {
                    gened_args.push(self.codegen_expr(arg)?);
                }

                Ok(self.backend.build_call(func, &gened_args))
            }
        }
    }

    /// Declares `proto`, or hands back an existing function with the same
    /// arity. A conflicting arity is reported as a redefinition.
    pub fn compile_proto(&mut self, proto: &Prototype) -> CodegenResult<B::Function> {
        if let Some(existing) = self.backend.get_function(&proto.name) {
            if self.backend.param_count(existing) == proto.args.len() {
                return Ok(existing);
            }
            return Err(CodegenError::Redefinition(proto.name.clone()));
        }

        log::debug!("declaring {}", proto);
        Ok(self.backend.declare_function(&proto.name, &proto.args))
    }

    pub fn compile_fn(&mut self, function: &Function) -> CodegenResult<B::Function> {
        let Function {
            prototype: proto,
            body,
        } = function;

        let (func, reused) = match self.backend.get_function(&proto.name) {
            Some(existing) => {
                if self.backend.has_body(existing) {
                    return Err(CodegenError::Redefinition(proto.name.clone()));
                }
                (existing, true)
            }
            None => (self.compile_proto(proto)?, false),
        };

        self.backend.begin_body(func);

        // the declared signature is authoritative, names included; duplicate
        // parameter names resolve to the last one
        let names = self.backend.param_names(func);
        let params = self.backend.params(func);
        self.named_values.clear();
        self.named_values.reserve(params.len());
        for (name, arg) in names.into_iter().zip(params) {
            self.named_values.insert(name, arg);
        }

        let result = self.codegen_expr(body).and_then(|ret| {
            self.backend.build_return(ret);
            if self.backend.verify(func) {
                Ok(())
            } else {
                Err(CodegenError::InvalidFunction(proto.name.clone()))
            }
        });

        match result {
            Ok(()) => {
                if self.optimize {
                    self.backend.optimize(func);
                }
                log::debug!("defined {}", proto);
                Ok(func)
            }
            Err(err) => {
                if reused {
                    log::debug!("rolling {} back to its declaration", proto);
                    self.backend.clear_body(func);
                } else {
                    log::debug!("discarding {}", proto);
                    self.backend.remove_function(func);
                }
                Err(err)
            }
        }
    }
}
