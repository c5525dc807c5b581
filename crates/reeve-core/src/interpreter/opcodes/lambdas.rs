//! Lambda opcode handlers

use std::sync::Arc;

use indexmap::IndexMap;

use reeve_bytecode::{Instruction, Lambda, Opcode, Value};

use crate::interpreter::Executor;
use crate::process::{ExecState, Process};
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_lambda_ops(
        &self,
        proc: &Arc<Process>,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        match op {
            // Operand: [body, capture-names] or [body, capture-names,
            // param-names]. Captures missing from globals are skipped.
            Opcode::LambdaCreate => {
                let Value::Array(parts) = &instr.operand else {
                    return Err(VmError::TypeMismatch {
                        expected: "[body, capture-names]".into(),
                        found: instr.operand.type_name().into(),
                    });
                };
                let body = match parts.first() {
                    Some(Value::Instructions(code)) => code.as_ref().clone(),
                    Some(other) => {
                        return Err(VmError::TypeMismatch {
                            expected: "lambda body".into(),
                            found: other.type_name().into(),
                        })
                    }
                    None => return Err(VmError::Value("lambda body is missing".into())),
                };
                let capture_names = name_list(parts.get(1))?;
                let params = name_list(parts.get(2))?;

                let mut captured = IndexMap::new();
                for name in capture_names {
                    if let Some(value) = exec.globals.get(&name) {
                        captured.insert(name, value.clone());
                    }
                }
                let lambda = Lambda::new(body, params).with_captures(captured);
                self.push(exec, Value::Lambda(Box::new(lambda)))?;
            }
            Opcode::LambdaInvoke => {
                let count = arg_count(&instr.operand)?;
                let args = self.pop_args(exec, count, op)?;
                let lambda = self.pop_lambda(exec, op)?;
                let result = self.invoke_lambda_inline(proc, exec, &lambda, args)?;
                self.push(exec, result)?;
            }
            Opcode::LambdaBind => {
                let count = arg_count(&instr.operand)?;
                let args = self.pop_args(exec, count, op)?;
                let lambda = self.pop_lambda(exec, op)?;
                let bound = lambda.bind(args);
                self.push(exec, Value::Lambda(Box::new(bound)))?;
            }
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a lambda opcode",
                    other
                )))
            }
        }
        Ok(())
    }

    pub(in crate::interpreter) fn pop_lambda(
        &self,
        exec: &mut ExecState,
        op: Opcode,
    ) -> VmResult<Lambda> {
        match self.pop(exec, op)? {
            Value::Lambda(lambda) => Ok(*lambda),
            other => Err(VmError::TypeMismatch {
                expected: "lambda".into(),
                found: other.type_name().into(),
            }),
        }
    }
}

fn arg_count(operand: &Value) -> VmResult<usize> {
    operand.as_address().map(|n| n as usize).ok_or_else(|| {
        VmError::TypeMismatch {
            expected: "argument count".into(),
            found: operand.type_name().into(),
        }
    })
}

fn name_list(value: Option<&Value>) -> VmResult<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_name().map(str::to_string).ok_or_else(|| {
                    VmError::TypeMismatch {
                        expected: "name".into(),
                        found: item.type_name().into(),
                    }
                })
            })
            .collect(),
        Some(other) => Err(VmError::TypeMismatch {
            expected: "array of names".into(),
            found: other.type_name().into(),
        }),
    }
}
