use inkwell::{
    builder::Builder,
    context::Context,
    execution_engine::JitFunction,
    module::Module,
    passes::PassManager,
    targets::{InitializationConfig, Target},
    types::BasicTypeEnum,
    values::{BasicValueEnum, FloatValue, FunctionValue, IntValue},
    FloatPredicate, OptimizationLevel,
};

use crate::codegen::{ArithOp, Backend, Execute};

type EntryFunc = unsafe extern "C" fn() -> f64;

const ANON_SYMBOL: &str = "__anon_expr";

#[derive(Debug, thiserror::Error)]
pub enum LlvmError {
    #[error("failed to initialize native target: {0}")]
    Target(String),
    #[error("failed to create execution engine: {0}")]
    Engine(String),
    #[error("jit lookup of {0} failed: {1}")]
    Lookup(String, String),
}

fn symbol(name: &str) -> &str {
    if name.is_empty() {
        ANON_SYMBOL
    } else {
        name
    }
}

/// Prints a character to stderr; callable from jitted code as `putchard`.
#[no_mangle]
pub extern "C" fn putchard(x: f64) -> f64 {
    eprint!("{}", x as u8 as char);
    0.0
}

/// Prints a double and a newline to stderr; callable as `printd`.
#[no_mangle]
pub extern "C" fn printd(x: f64) -> f64 {
    eprintln!("{}", x);
    0.0
}

// keep the runtime helpers from being stripped before the jit looks them up
#[used]
static RUNTIME: [extern "C" fn(f64) -> f64; 2] = [putchard, printd];

pub struct LlvmBackend<'a> {
    pub context: &'a Context,
    pub module: Module<'a>,
    pub builder: Builder<'a>,
    fpm: PassManager<FunctionValue<'a>>,
}

impl<'a> LlvmBackend<'a> {
    pub fn new(context: &'a Context, name: &str) -> Result<LlvmBackend<'a>, LlvmError> {
        Target::initialize_native(&InitializationConfig::default()).map_err(LlvmError::Target)?;

        let module = context.create_module(name);
        let builder = context.create_builder();

        let fpm = PassManager::create(&module);
        fpm.add_instruction_combining_pass();
        fpm.add_reassociate_pass();
        fpm.add_gvn_pass();
        fpm.add_cfg_simplification_pass();
        fpm.initialize();

        Ok(LlvmBackend {
            context,
            module,
            builder,
            fpm,
        })
    }
}

impl<'a> Backend for LlvmBackend<'a> {
    type Value = FloatValue<'a>;
    type Flag = IntValue<'a>;
    type Function = FunctionValue<'a>;

    fn const_float(&mut self, value: f64) -> FloatValue<'a> {
        self.context.f64_type().const_float(value)
    }

    fn build_arith(
        &mut self,
        op: ArithOp,
        lhs: FloatValue<'a>,
        rhs: FloatValue<'a>,
    ) -> FloatValue<'a> {
        match op {
            ArithOp::Add => self.builder.build_float_add(lhs, rhs, "tmpadd"),
            ArithOp::Sub => self.builder.build_float_sub(lhs, rhs, "tmpsub"),
            ArithOp::Mul => self.builder.build_float_mul(lhs, rhs, "tmpmul"),
            ArithOp::Div => self.builder.build_float_div(lhs, rhs, "tmpdiv"),
        }
    }

    fn build_less_than(&mut self, lhs: FloatValue<'a>, rhs: FloatValue<'a>) -> IntValue<'a> {
        self.builder
            .build_float_compare(FloatPredicate::ULT, lhs, rhs, "tmpcmp")
    }

    fn widen(&mut self, flag: IntValue<'a>) -> FloatValue<'a> {
        self.builder
            .build_unsigned_int_to_float(flag, self.context.f64_type(), "tmpbool")
    }

    fn build_call(&mut self, callee: FunctionValue<'a>, args: &[FloatValue<'a>]) -> FloatValue<'a> {
        let argsv: Vec<BasicValueEnum> = args.iter().map(|&val| val.into()).collect();
        match self
            .builder
            .build_call(callee, argsv.as_slice(), "tmp")
            .try_as_basic_value()
            .left()
        {
            Some(value) => value.into_float_value(),
            // every function returns a double, so a void call cannot be built
            None => self.context.f64_type().get_undef(),
        }
    }

    fn build_return(&mut self, value: FloatValue<'a>) {
        self.builder.build_return(Some(&value));
    }

    fn get_function(&self, name: &str) -> Option<FunctionValue<'a>> {
        self.module.get_function(symbol(name))
    }

    fn param_count(&self, function: FunctionValue<'a>) -> usize {
        function.count_params() as usize
    }

    fn has_body(&self, function: FunctionValue<'a>) -> bool {
        function.count_basic_blocks() > 0
    }

    fn declare_function(&mut self, name: &str, params: &[String]) -> FunctionValue<'a> {
        let args_types = std::iter::repeat(self.context.f64_type())
            .take(params.len())
            .map(|f| f.into())
            .collect::<Vec<BasicTypeEnum>>();
        let args_types = args_types.as_slice();

        let fn_type = self.context.f64_type().fn_type(args_types, false);
        let fn_val = self.module.add_function(symbol(name), fn_type, None);

        for (arg, name) in fn_val.get_param_iter().zip(params) {
            arg.into_float_value().set_name(name.as_str());
        }

        fn_val
    }

    fn param_names(&self, function: FunctionValue<'a>) -> Vec<String> {
        function
            .get_param_iter()
            .map(|arg| {
                arg.into_float_value()
                    .get_name()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    fn params(&self, function: FunctionValue<'a>) -> Vec<FloatValue<'a>> {
        function
            .get_param_iter()
            .map(|arg| arg.into_float_value())
            .collect()
    }

    fn begin_body(&mut self, function: FunctionValue<'a>) {
        let entry = self.context.append_basic_block(function, "entry");
        self.builder.position_at_end(entry);
    }

    fn clear_body(&mut self, function: FunctionValue<'a>) {
        for block in function.get_basic_blocks() {
            unsafe {
                let _ = block.delete();
            }
        }
    }

    fn remove_function(&mut self, function: FunctionValue<'a>) {
        unsafe {
            function.delete();
        }
    }

    fn verify(&self, function: FunctionValue<'a>) -> bool {
        function.verify(true)
    }

    fn optimize(&mut self, function: FunctionValue<'a>) {
        self.fpm.run_on(&function);
    }

    fn function_ir(&self, function: FunctionValue<'a>) -> String {
        function.print_to_string().to_string_lossy().into_owned()
    }

    fn print_ir(&self) -> String {
        self.module.print_to_string().to_string_lossy().into_owned()
    }
}

impl<'a> Execute for LlvmBackend<'a> {
    type Error = LlvmError;

    /// Jits a snapshot of the module, so functions defined later are picked
    /// up by the next call.
    fn execute(&mut self, function: FunctionValue<'a>) -> Result<f64, LlvmError> {
        let name = function.get_name().to_string_lossy().into_owned();
        let module = self.module.clone();
        let ee = module
            .create_jit_execution_engine(OptimizationLevel::None)
            .map_err(|e| LlvmError::Engine(e.to_string_lossy().into_owned()))?;

        let entry: JitFunction<EntryFunc> = unsafe { ee.get_function(&name) }
            .map_err(|e| LlvmError::Lookup(name.clone(), e.to_string()))?;

        Ok(unsafe { entry.call() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::Codegen;
    use crate::parser::Parser;

    #[test]
    fn codegen_works() {
        let context = Context::create();
        let mut codegen = Codegen::new(LlvmBackend::new(&context, "test").unwrap());

        let mut parser = Parser::new("extern sin(x) def thing(x) sin(x) * x 4 * 2".chars());
        parser.advance().unwrap();
        let sin = parser.parse_extern().unwrap();
        let thing = parser.parse_definition().unwrap();
        let top = parser.parse_top_level_expr().unwrap();

        codegen.compile_proto(&sin).unwrap();
        let thing = codegen.compile_fn(&thing).unwrap();
        assert!(codegen.backend.function_ir(thing).contains("call double @sin"));

        let top = codegen.compile_fn(&top).unwrap();
        assert_eq!(codegen.backend.execute(top).unwrap(), 8.0);
        codegen.backend.remove_function(top);
        assert!(codegen.backend.get_function("").is_none());
    }
}
