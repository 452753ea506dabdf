use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use std::collections::BTreeSet;

use crate::{Literal, Params, Primitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    Var(VarId),
    Lit(Literal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equation {
    pub primitive: Primitive,
    pub inputs: SmallVec<[Atom; 4]>,
    pub outputs: SmallVec<[VarId; 2]>,
    pub params: Params,
}

/// A straight-line array program: each equation binds fresh variables from
/// earlier bindings, and `outvars` names the results in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub invars: Vec<VarId>,
    pub outvars: Vec<VarId>,
    pub equations: Vec<Equation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramValidationError {
    DuplicateBinding { section: &'static str, var: VarId },
    UnboundInputVar { equation_index: usize, var: VarId },
    OutputShadowsBinding { equation_index: usize, var: VarId },
    UnknownOutvar { var: VarId },
}

impl std::fmt::Display for ProgramValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateBinding { section, var } => {
                write!(f, "duplicate binding in {} for var v{}", section, var.0)
            }
            Self::UnboundInputVar {
                equation_index,
                var,
            } => {
                write!(
                    f,
                    "equation {} references unbound input var v{}",
                    equation_index, var.0
                )
            }
            Self::OutputShadowsBinding {
                equation_index,
                var,
            } => {
                write!(
                    f,
                    "equation {} output var v{} shadows an existing binding",
                    equation_index, var.0
                )
            }
            Self::UnknownOutvar { var } => {
                write!(f, "outvar v{} does not have a defining binding", var.0)
            }
        }
    }
}

impl std::error::Error for ProgramValidationError {}

impl Program {
    #[must_use]
    pub fn new(invars: Vec<VarId>, outvars: Vec<VarId>, equations: Vec<Equation>) -> Self {
        Self {
            invars,
            outvars,
            equations,
        }
    }

    /// `out = primitive(in0, ..., in{arity-1})` as a one-equation program.
    #[must_use]
    pub fn nary(primitive: Primitive, arity: u32, params: Params) -> Self {
        let invars: Vec<VarId> = (0..arity).map(VarId).collect();
        let out = VarId(arity);
        Self {
            invars: invars.clone(),
            outvars: vec![out],
            equations: vec![Equation {
                primitive,
                inputs: invars.into_iter().map(Atom::Var).collect(),
                outputs: smallvec![out],
                params,
            }],
        }
    }

    #[must_use]
    pub fn unary(primitive: Primitive, params: Params) -> Self {
        Self::nary(primitive, 1, params)
    }

    #[must_use]
    pub fn binary(primitive: Primitive, params: Params) -> Self {
        Self::nary(primitive, 2, params)
    }

    #[must_use]
    pub fn ternary(primitive: Primitive, params: Params) -> Self {
        Self::nary(primitive, 3, params)
    }

    /// Short human-readable label built from the equation primitives.
    #[must_use]
    pub fn label(&self) -> String {
        let names: Vec<&str> = self
            .equations
            .iter()
            .map(|eqn| eqn.primitive.as_str())
            .collect();
        if names.is_empty() {
            "identity".to_owned()
        } else {
            names.join("+")
        }
    }

    pub fn validate_well_formed(&self) -> Result<(), ProgramValidationError> {
        let mut bindings = BTreeSet::new();

        for var in &self.invars {
            if !bindings.insert(*var) {
                return Err(ProgramValidationError::DuplicateBinding {
                    section: "invars",
                    var: *var,
                });
            }
        }

        for (equation_index, eqn) in self.equations.iter().enumerate() {
            for atom in &eqn.inputs {
                if let Atom::Var(var) = atom
                    && !bindings.contains(var)
                {
                    return Err(ProgramValidationError::UnboundInputVar {
                        equation_index,
                        var: *var,
                    });
                }
            }
            for out_var in &eqn.outputs {
                if !bindings.insert(*out_var) {
                    return Err(ProgramValidationError::OutputShadowsBinding {
                        equation_index,
                        var: *out_var,
                    });
                }
            }
        }

        for outvar in &self.outvars {
            if !bindings.contains(outvar) {
                return Err(ProgramValidationError::UnknownOutvar { var: *outvar });
            }
        }

        Ok(())
    }
}

/// Incremental construction of multi-equation programs.
///
/// ```
/// use bc_core::{Atom, Literal, Params, Primitive, ProgramBuilder};
///
/// let mut builder = ProgramBuilder::new();
/// let x = builder.input();
/// let y = builder.input();
/// let negative = builder.push(
///     Primitive::Lt,
///     [Atom::Var(x), Atom::Lit(Literal::from_f64(0.0))],
///     Params::new(),
/// );
/// let out = builder.push(
///     Primitive::Select,
///     [Atom::Var(negative), Atom::Var(x), Atom::Var(y)],
///     Params::new(),
/// );
/// builder.output(out);
/// let program = builder.build();
/// assert!(program.validate_well_formed().is_ok());
/// ```
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    next_var: u32,
    invars: Vec<VarId>,
    outvars: Vec<VarId>,
    equations: Vec<Equation>,
}

impl ProgramBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self) -> VarId {
        let var = VarId(self.next_var);
        self.next_var += 1;
        var
    }

    pub fn input(&mut self) -> VarId {
        let var = self.fresh();
        self.invars.push(var);
        var
    }

    /// Append a single-output equation and return its output variable.
    pub fn push(
        &mut self,
        primitive: Primitive,
        inputs: impl IntoIterator<Item = Atom>,
        params: Params,
    ) -> VarId {
        let out = self.fresh();
        self.equations.push(Equation {
            primitive,
            inputs: inputs.into_iter().collect(),
            outputs: smallvec![out],
            params,
        });
        out
    }

    pub fn output(&mut self, var: VarId) {
        self.outvars.push(var);
    }

    #[must_use]
    pub fn build(self) -> Program {
        Program::new(self.invars, self.outvars, self.equations)
    }
}

#[cfg(test)]
mod tests {
    use super::{Atom, Equation, Program, ProgramBuilder, ProgramValidationError, VarId};
    use crate::{Params, Primitive};
    use smallvec::smallvec;

    #[test]
    fn nary_builds_single_equation() {
        let program = Program::ternary(Primitive::Clamp, Params::new());
        assert_eq!(program.invars, vec![VarId(0), VarId(1), VarId(2)]);
        assert_eq!(program.outvars, vec![VarId(3)]);
        assert_eq!(program.equations.len(), 1);
        assert_eq!(program.label(), "clamp");
        assert!(program.validate_well_formed().is_ok());
    }

    #[test]
    fn builder_chains_equations() {
        let mut builder = ProgramBuilder::new();
        let x = builder.input();
        let sorted = builder.push(Primitive::Sort, [Atom::Var(x)], Params::new());
        let order = builder.push(Primitive::Argsort, [Atom::Var(x)], Params::new());
        builder.output(sorted);
        builder.output(order);
        let program = builder.build();
        assert_eq!(program.outvars.len(), 2);
        assert_eq!(program.label(), "sort+argsort");
        assert!(program.validate_well_formed().is_ok());
    }

    #[test]
    fn unbound_input_is_rejected() {
        let program = Program::new(
            vec![VarId(0)],
            vec![VarId(2)],
            vec![Equation {
                primitive: Primitive::Add,
                inputs: smallvec![Atom::Var(VarId(0)), Atom::Var(VarId(1))],
                outputs: smallvec![VarId(2)],
                params: Params::new(),
            }],
        );
        assert_eq!(
            program.validate_well_formed(),
            Err(ProgramValidationError::UnboundInputVar {
                equation_index: 0,
                var: VarId(1)
            })
        );
    }

    #[test]
    fn unknown_outvar_is_rejected() {
        let program = Program::new(vec![VarId(0)], vec![VarId(9)], Vec::new());
        assert_eq!(
            program.validate_well_formed(),
            Err(ProgramValidationError::UnknownOutvar { var: VarId(9) })
        );
    }

    #[test]
    fn shadowed_output_is_rejected() {
        let program = Program::new(
            vec![VarId(0)],
            vec![VarId(0)],
            vec![Equation {
                primitive: Primitive::Neg,
                inputs: smallvec![Atom::Var(VarId(0))],
                outputs: smallvec![VarId(0)],
                params: Params::new(),
            }],
        );
        assert!(matches!(
            program.validate_well_formed(),
            Err(ProgramValidationError::OutputShadowsBinding { .. })
        ));
    }
}
