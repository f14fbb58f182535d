//! A small in-process code generation backend.
//!
//! Functions live in a [`Module`] and are addressed by [`FuncId`]. A body is a
//! single entry block of [`Inst`]s in SSA form: the result of instruction `i`
//! is the temporary `Operand::Temp(i)`. The block under construction is kept
//! aside until `build_return` commits it, so an abandoned body never leaks
//! into the module.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as _};
use std::io;

use crate::codegen::{ArithOp, Backend, Execute};
use crate::interp::{ExecError, Interpreter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Const(f64),
    Param(usize),
    Temp(usize),
}

/// One-bit comparison result; only `Inst::Widen` accepts it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Flag(pub Operand);

#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Arith {
        op: ArithOp,
        lhs: Operand,
        rhs: Operand,
    },
    LessThan {
        lhs: Operand,
        rhs: Operand,
    },
    Widen(Flag),
    Call {
        callee: FuncId,
        args: Vec<Operand>,
    },
    Ret(Operand),
    /// Left behind by the optimizer so temporaries keep their numbers.
    Nop,
}

impl Inst {
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Inst::Arith { lhs, rhs, .. } | Inst::LessThan { lhs, rhs } => vec![*lhs, *rhs],
            Inst::Widen(Flag(op)) | Inst::Ret(op) => vec![*op],
            Inst::Call { args, .. } => args.clone(),
            Inst::Nop => Vec::new(),
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Operand> {
        match self {
            Inst::Arith { lhs, rhs, .. } | Inst::LessThan { lhs, rhs } => vec![lhs, rhs],
            Inst::Widen(Flag(op)) | Inst::Ret(op) => vec![op],
            Inst::Call { args, .. } => args.iter_mut().collect(),
            Inst::Nop => Vec::new(),
        }
    }

    /// Instructions that may be dropped when their result is unused.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            Inst::Arith { .. } | Inst::LessThan { .. } | Inst::Widen(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Double,
    Bool,
    Void,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionData {
    pub name: String,
    pub params: Vec<String>,
    pub body: Option<Vec<Inst>>,
}

impl FunctionData {
    fn symbol(&self) -> &str {
        if self.name.is_empty() {
            "__anon_expr"
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Default)]
pub struct Module {
    pub name: String,
    /// Keyed by id; ids are never reused, so a removed function's slot is
    /// freed without disturbing the ids of the others.
    functions: BTreeMap<FuncId, FunctionData>,
    next_id: usize,
    names: HashMap<String, FuncId>,
    cursor: Option<FuncId>,
    block: Vec<Inst>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            ..Module::default()
        }
    }

    pub fn function(&self, id: FuncId) -> Option<&FunctionData> {
        self.functions.get(&id)
    }

    fn function_mut(&mut self, id: FuncId) -> Option<&mut FunctionData> {
        self.functions.get_mut(&id)
    }

    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &FunctionData)> {
        self.functions.iter().map(|(&id, f)| (id, f))
    }

    fn push(&mut self, inst: Inst) -> Operand {
        self.block.push(inst);
        Operand::Temp(self.block.len() - 1)
    }

    pub(crate) fn body_mut(&mut self, id: FuncId) -> Option<&mut Vec<Inst>> {
        self.function_mut(id).and_then(|f| f.body.as_mut())
    }

    fn check(&self, func: &FunctionData) -> Result<(), String> {
        let body = func.body.as_ref().ok_or("function has no body")?;
        let mut kinds: Vec<Kind> = Vec::with_capacity(body.len());

        let kind_of = |op: &Operand, kinds: &[Kind]| -> Result<Kind, String> {
            match *op {
                Operand::Const(_) => Ok(Kind::Double),
                Operand::Param(i) if i < func.params.len() => Ok(Kind::Double),
                Operand::Param(i) => Err(format!("parameter {} out of range", i)),
                Operand::Temp(t) => match kinds.get(t) {
                    Some(Kind::Void) => Err(format!("%t{} has no value", t)),
                    Some(&kind) => Ok(kind),
                    None => Err(format!("%t{} used before definition", t)),
                },
            }
        };

        for (i, inst) in body.iter().enumerate() {
            let kind = match inst {
                Inst::Arith { lhs, rhs, .. } | Inst::LessThan { lhs, rhs } => {
                    for &op in &[lhs, rhs] {
                        if kind_of(op, &kinds[..])? != Kind::Double {
                            return Err(format!("%t{}: operand is not a double", i));
                        }
                    }
                    match inst {
                        Inst::LessThan { .. } => Kind::Bool,
                        _ => Kind::Double,
                    }
                }
                Inst::Widen(Flag(op)) => {
                    // folded comparisons become constants
                    match (op, kind_of(op, &kinds[..])?) {
                        (Operand::Const(_), _) | (_, Kind::Bool) => Kind::Double,
                        _ => return Err(format!("%t{}: widening a non-boolean", i)),
                    }
                }
                Inst::Call { callee, args } => {
                    let target = self
                        .function(*callee)
                        .ok_or_else(|| format!("%t{}: call to a removed function", i))?;
                    if target.params.len() != args.len() {
                        return Err(format!(
                            "%t{}: wrong argument count for @{}",
                            i,
                            target.symbol()
                        ));
                    }
                    for op in args {
                        if kind_of(op, &kinds[..])? != Kind::Double {
                            return Err(format!("%t{}: argument is not a double", i));
                        }
                    }
                    Kind::Double
                }
                Inst::Ret(op) => {
                    if i + 1 != body.len() {
                        return Err("ret is not the last instruction".to_string());
                    }
                    if kind_of(op, &kinds[..])? != Kind::Double {
                        return Err("returning a non-double".to_string());
                    }
                    Kind::Void
                }
                Inst::Nop => Kind::Void,
            };
            kinds.push(kind);
        }

        match body.last() {
            Some(Inst::Ret(_)) => Ok(()),
            _ => Err("block is not terminated".to_string()),
        }
    }

    fn fmt_operand(&self, func: &FunctionData, op: &Operand, out: &mut String) {
        let _ = match op {
            Operand::Const(value) => write!(out, "{:?}", value),
            Operand::Param(i) => match func.params.get(*i) {
                Some(name) => write!(out, "%{}", name),
                None => write!(out, "%arg{}", i),
            },
            Operand::Temp(t) => write!(out, "%t{}", t),
        };
    }

    fn render(&self, func: &FunctionData, out: &mut String) {
        let params = func
            .params
            .iter()
            .map(|p| format!("double %{}", p))
            .collect::<Vec<_>>()
            .join(", ");

        let body = match &func.body {
            Some(body) => body,
            None => {
                let _ = writeln!(out, "declare double @{}({})", func.symbol(), params);
                return;
            }
        };

        let _ = writeln!(out, "define double @{}({}) {{", func.symbol(), params);
        let _ = writeln!(out, "entry:");
        for (i, inst) in body.iter().enumerate() {
            match inst {
                Inst::Nop => continue,
                Inst::Ret(op) => {
                    out.push_str("  ret double ");
                    self.fmt_operand(func, op, out);
                }
                Inst::Arith { op, lhs, rhs } => {
                    let _ = write!(out, "  %t{} = {} double ", i, op.mnemonic());
                    self.fmt_operand(func, lhs, out);
                    out.push_str(", ");
                    self.fmt_operand(func, rhs, out);
                }
                Inst::LessThan { lhs, rhs } => {
                    let _ = write!(out, "  %t{} = fcmp ult double ", i);
                    self.fmt_operand(func, lhs, out);
                    out.push_str(", ");
                    self.fmt_operand(func, rhs, out);
                }
                Inst::Widen(Flag(op)) => {
                    let _ = write!(out, "  %t{} = uitofp i1 ", i);
                    self.fmt_operand(func, op, out);
                    out.push_str(" to double");
                }
                Inst::Call { callee, args } => {
                    let target = self.function(*callee).map_or("<removed>", FunctionData::symbol);
                    let _ = write!(out, "  %t{} = call double @{}(", i, target);
                    for (n, arg) in args.iter().enumerate() {
                        if n > 0 {
                            out.push_str(", ");
                        }
                        out.push_str("double ");
                        self.fmt_operand(func, arg, out);
                    }
                    out.push(')');
                }
            }
            out.push('\n');
        }
        out.push_str("}\n");
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        let mut out = String::new();
        for (_, func) in self.functions() {
            out.push('\n');
            self.render(func, &mut out);
        }
        f.write_str(&out)
    }
}

impl Backend for Module {
    type Value = Operand;
    type Flag = Flag;
    type Function = FuncId;

    fn const_float(&mut self, value: f64) -> Operand {
        Operand::Const(value)
    }

    fn build_arith(&mut self, op: ArithOp, lhs: Operand, rhs: Operand) -> Operand {
        self.push(Inst::Arith { op, lhs, rhs })
    }

    fn build_less_than(&mut self, lhs: Operand, rhs: Operand) -> Flag {
        Flag(self.push(Inst::LessThan { lhs, rhs }))
    }

    fn widen(&mut self, flag: Flag) -> Operand {
        self.push(Inst::Widen(flag))
    }

    fn build_call(&mut self, callee: FuncId, args: &[Operand]) -> Operand {
        self.push(Inst::Call {
            callee,
            args: args.to_vec(),
        })
    }

    fn build_return(&mut self, value: Operand) {
        self.push(Inst::Ret(value));
        let block = std::mem::take(&mut self.block);
        match self.cursor.take().and_then(|id| self.function_mut(id)) {
            Some(func) => func.body = Some(block),
            None => log::warn!("ret built without an insertion point"),
        }
    }

    fn get_function(&self, name: &str) -> Option<FuncId> {
        self.names.get(name).copied()
    }

    fn param_count(&self, function: FuncId) -> usize {
        self.function(function).map_or(0, |f| f.params.len())
    }

    fn has_body(&self, function: FuncId) -> bool {
        self.function(function).map_or(false, |f| f.body.is_some())
    }

    fn declare_function(&mut self, name: &str, params: &[String]) -> FuncId {
        let id = FuncId(self.next_id);
        self.next_id += 1;
        self.functions.insert(
            id,
            FunctionData {
                name: name.to_string(),
                params: params.to_vec(),
                body: None,
            },
        );
        self.names.insert(name.to_string(), id);
        id
    }

    fn param_names(&self, function: FuncId) -> Vec<String> {
        self.function(function)
            .map_or_else(Vec::new, |f| f.params.clone())
    }

    fn params(&self, function: FuncId) -> Vec<Operand> {
        (0..self.param_count(function)).map(Operand::Param).collect()
    }

    fn begin_body(&mut self, function: FuncId) {
        self.cursor = Some(function);
        self.block.clear();
    }

    fn clear_body(&mut self, function: FuncId) {
        if self.cursor == Some(function) {
            self.cursor = None;
            self.block.clear();
        }
        if let Some(func) = self.function_mut(function) {
            func.body = None;
        }
    }

    fn remove_function(&mut self, function: FuncId) {
        self.clear_body(function);
        if let Some(func) = self.functions.remove(&function) {
            if self.names.get(&func.name) == Some(&function) {
                self.names.remove(&func.name);
            }
        }
    }

    fn verify(&self, function: FuncId) -> bool {
        let func = match self.function(function) {
            Some(func) => func,
            None => return false,
        };
        match self.check(func) {
            Ok(()) => true,
            Err(msg) => {
                log::warn!("verification of @{} failed: {}", func.symbol(), msg);
                false
            }
        }
    }

    fn optimize(&mut self, function: FuncId) {
        if let Some(body) = self.body_mut(function) {
            crate::opt::run(body);
        }
    }

    fn function_ir(&self, function: FuncId) -> String {
        let mut out = String::new();
        if let Some(func) = self.function(function) {
            self.render(func, &mut out);
        }
        out
    }

    fn print_ir(&self) -> String {
        self.to_string()
    }
}

impl Execute for Module {
    type Error = ExecError;

    fn execute(&mut self, function: FuncId) -> Result<f64, ExecError> {
        Interpreter::new(self, io::stderr()).call(function, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn define(
        module: &mut Module,
        name: &str,
        params: &[&str],
        build: impl FnOnce(&mut Module) -> Operand,
    ) -> FuncId {
        let params: Vec<String> = params.iter().map(|p| p.to_string()).collect();
        let id = module.declare_function(name, &params);
        module.begin_body(id);
        let ret = build(module);
        module.build_return(ret);
        id
    }

    #[test]
    fn prints_module() {
        let mut module = Module::new("demo");
        let sin = module.declare_function("sin", &["x".to_string()]);
        define(&mut module, "f", &["x", "y"], |m| {
            let sum = m.build_arith(ArithOp::Add, Operand::Param(0), Operand::Param(1));
            let cmp = m.build_less_than(sum, Operand::Const(1.0));
            let wide = m.widen(cmp);
            m.build_call(sin, &[wide])
        });
        let expected = "\
; ModuleID = 'demo'

declare double @sin(double %x)

define double @f(double %x, double %y) {
entry:
  %t0 = fadd double %x, %y
  %t1 = fcmp ult double %t0, 1.0
  %t2 = uitofp i1 %t1 to double
  %t3 = call double @sin(double %t2)
  ret double %t3
}
";
        assert_eq!(module.print_ir(), expected);
    }

    #[test]
    fn body_is_committed_on_return() {
        let mut module = Module::new("demo");
        let f = module.declare_function("f", &[]);
        module.begin_body(f);
        module.build_arith(ArithOp::Add, Operand::Const(1.0), Operand::Const(2.0));
        assert!(!module.has_body(f));
        module.build_return(Operand::Temp(0));
        assert!(module.has_body(f));
        assert!(module.verify(f));
    }

    #[test]
    fn verify_rejects_bad_bodies() {
        let mut module = Module::new("demo");
        let callee = module.declare_function("two", &["a".to_string(), "b".to_string()]);

        let bad_call = define(&mut module, "c", &[], |m| {
            m.build_call(callee, &[Operand::Const(1.0)])
        });
        assert!(!module.verify(bad_call));

        let bad_param = define(&mut module, "p", &["x"], |_| Operand::Param(3));
        assert!(!module.verify(bad_param));

        let unwidened = define(&mut module, "w", &[], |m| {
            let Flag(cmp) = m.build_less_than(Operand::Const(1.0), Operand::Const(2.0));
            cmp
        });
        assert!(!module.verify(unwidened));

        let decl = module.declare_function("d", &[]);
        assert!(!module.verify(decl));
    }

    #[test]
    fn remove_frees_the_name() {
        let mut module = Module::new("demo");
        let f = module.declare_function("f", &[]);
        module.remove_function(f);
        assert_eq!(module.get_function("f"), None);
        assert_eq!(module.function(f), None);
        let again = module.declare_function("f", &[]);
        assert_ne!(again, f);
        assert_eq!(module.get_function("f"), Some(again));
    }

    #[test]
    fn removed_functions_free_their_slot() {
        let mut module = Module::new("demo");
        let keep = module.declare_function("keep", &[]);
        for _ in 0..10 {
            let anon = define(&mut module, "", &[], |_| Operand::Const(1.0));
            module.remove_function(anon);
        }
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.function(keep).map(|f| f.name.as_str()), Some("keep"));
        assert_eq!(module.get_function("keep"), Some(keep));
    }

    #[test]
    fn abandoned_block_does_not_leak() {
        let mut module = Module::new("demo");
        let f = module.declare_function("f", &[]);
        module.begin_body(f);
        module.build_arith(ArithOp::Mul, Operand::Const(1.0), Operand::Const(2.0));
        module.clear_body(f);

        let g = define(&mut module, "g", &[], |_| Operand::Const(5.0));
        assert_eq!(
            module.function(g).and_then(|g| g.body.clone()),
            Some(vec![Inst::Ret(Operand::Const(5.0))])
        );
    }

    #[test]
    fn anonymous_functions_get_a_symbol() {
        let mut module = Module::new("demo");
        let anon = define(&mut module, "", &[], |_| Operand::Const(1.0));
        assert!(module.function_ir(anon).starts_with("define double @__anon_expr()"));
        assert_eq!(module.get_function(""), Some(anon));
    }
}
