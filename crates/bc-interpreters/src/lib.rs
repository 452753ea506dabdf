#![forbid(unsafe_code)]

use bc_core::{Atom, Primitive, Program, ProgramValidationError, Value, VarId};
use bc_lax::{EvalError, eval_primitive};
use log::trace;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    InputArity {
        expected: usize,
        actual: usize,
    },
    MissingVariable(VarId),
    UnexpectedOutputArity {
        primitive: Primitive,
        actual: usize,
    },
    InvalidProgram(ProgramValidationError),
    Primitive(EvalError),
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(
                    f,
                    "input arity mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::MissingVariable(var) => write!(f, "missing variable v{}", var.0),
            Self::UnexpectedOutputArity { primitive, actual } => write!(
                f,
                "expected single-output primitive {}, got {} outputs",
                primitive.as_str(),
                actual
            ),
            Self::InvalidProgram(err) => write!(f, "invalid program: {err}"),
            Self::Primitive(err) => write!(f, "primitive eval failed: {err}"),
        }
    }
}

impl std::error::Error for InterpreterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidProgram(err) => Some(err),
            Self::Primitive(err) => Some(err),
            _ => None,
        }
    }
}

impl From<EvalError> for InterpreterError {
    fn from(value: EvalError) -> Self {
        Self::Primitive(value)
    }
}

impl From<ProgramValidationError> for InterpreterError {
    fn from(value: ProgramValidationError) -> Self {
        Self::InvalidProgram(value)
    }
}

/// Evaluate `program` on concrete arguments, returning its outputs in order.
pub fn eval_program(program: &Program, args: &[Value]) -> Result<Vec<Value>, InterpreterError> {
    if args.len() != program.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: program.invars.len(),
            actual: args.len(),
        });
    }
    program.validate_well_formed()?;

    let mut env: FxHashMap<VarId, Value> =
        FxHashMap::with_capacity_and_hasher(args.len() + program.equations.len(), Default::default());
    for (var, arg) in program.invars.iter().zip(args) {
        env.insert(*var, arg.clone());
    }

    for eqn in &program.equations {
        if eqn.outputs.len() != 1 {
            return Err(InterpreterError::UnexpectedOutputArity {
                primitive: eqn.primitive,
                actual: eqn.outputs.len(),
            });
        }

        let mut resolved = Vec::with_capacity(eqn.inputs.len());
        for atom in &eqn.inputs {
            match atom {
                Atom::Var(var) => {
                    let value = env
                        .get(var)
                        .cloned()
                        .ok_or(InterpreterError::MissingVariable(*var))?;
                    resolved.push(value);
                }
                Atom::Lit(lit) => resolved.push(Value::Scalar(*lit)),
            }
        }

        let output = eval_primitive(eqn.primitive, &resolved, &eqn.params)?;
        trace!(
            "eval {} -> v{} shape={} dtype={}",
            eqn.primitive,
            eqn.outputs[0].0,
            output.shape(),
            output.dtype()
        );
        env.insert(eqn.outputs[0], output);
    }

    program
        .outvars
        .iter()
        .map(|var| {
            env.get(var)
                .cloned()
                .ok_or(InterpreterError::MissingVariable(*var))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{InterpreterError, eval_program};
    use bc_core::{Atom, Literal, Params, Primitive, Program, ProgramBuilder, Value, VarId};

    #[test]
    fn eval_simple_add_program() {
        let program = Program::binary(Primitive::Add, Params::new());
        let outputs = eval_program(&program, &[Value::scalar_i64(4), Value::scalar_i64(5)]);
        assert_eq!(outputs, Ok(vec![Value::scalar_i64(9)]));
    }

    #[test]
    fn eval_chained_select_program() {
        let mut builder = ProgramBuilder::new();
        let x = builder.input();
        let y = builder.input();
        let negative = builder.push(
            Primitive::Lt,
            [Atom::Var(x), Atom::Lit(Literal::from_f64(0.0))],
            Params::new(),
        );
        let out = builder.push(
            Primitive::Select,
            [Atom::Var(negative), Atom::Var(x), Atom::Var(y)],
            Params::new(),
        );
        builder.output(out);
        let program = builder.build();

        let outputs = eval_program(
            &program,
            &[
                Value::vector_f64(&[-1.0, 2.0]).expect("vector value should build"),
                Value::vector_f64(&[10.0, 20.0]).expect("vector value should build"),
            ],
        )
        .expect("select program should evaluate");
        assert_eq!(
            outputs,
            vec![Value::vector_f64(&[-1.0, 20.0]).expect("vector value should build")]
        );
    }

    #[test]
    fn multiple_outvars_come_back_in_order() {
        let mut builder = ProgramBuilder::new();
        let x = builder.input();
        let sorted = builder.push(Primitive::Sort, [Atom::Var(x)], Params::new());
        let order = builder.push(Primitive::Argsort, [Atom::Var(x)], Params::new());
        builder.output(sorted);
        builder.output(order);
        let program = builder.build();

        let outputs = eval_program(
            &program,
            &[Value::vector_f64(&[2.0, 0.0, 1.0]).expect("vector value should build")],
        )
        .expect("sort program should evaluate");
        assert_eq!(outputs.len(), 2);
        assert_eq!(
            outputs[0],
            Value::vector_f64(&[0.0, 1.0, 2.0]).expect("vector value should build")
        );
        assert_eq!(
            outputs[1].to_tensor().to_i64_vec().expect("indices"),
            vec![1, 2, 0]
        );
    }

    #[test]
    fn input_arity_mismatch_is_reported() {
        let program = Program::binary(Primitive::Add, Params::new());
        let err = eval_program(&program, &[Value::scalar_i64(4)]).expect_err("should fail");
        assert_eq!(
            err,
            InterpreterError::InputArity {
                expected: 2,
                actual: 1,
            }
        );
    }

    #[test]
    fn malformed_program_is_rejected() {
        let program = Program::new(vec![VarId(0)], vec![VarId(5)], Vec::new());
        let err = eval_program(&program, &[Value::scalar_i64(1)]).expect_err("should fail");
        assert!(matches!(err, InterpreterError::InvalidProgram(_)));
    }
}
