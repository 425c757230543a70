//! Algorithms are an ordered list of functions that run remotely on workers.
//!
//! Each processing cycle runs the run-first functions, then the middle functions, then the
//! run-last functions, each group in the order it was declared. A parallel function is called
//! once per symbol, every other function is called once with all the symbols.
use std::collections::{HashMap, HashSet};

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Display, Error)]
pub enum AlgorithmError {
    #[display("function {name} cannot run both first and last")]
    FirstAndLast { name: String },
    #[display("function {name} is declared more than once")]
    DuplicateFunction { name: String },
    #[display("parameter {key} of {function} expects {kind} but got {value}")]
    ParameterType {
        function: String,
        key: String,
        kind: ParameterKind,
        value: Value,
    },
    #[display("unknown function {name}")]
    UnknownFunction { name: String },
    #[display("function {function} has no parameter {key}")]
    UnknownParameter { function: String, key: String },
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    #[display("int")]
    Int,
    #[display("float")]
    Float,
    #[display("string")]
    String,
    #[display("bool")]
    Bool,
    #[display("list")]
    List,
    #[display("dict")]
    Dict,
}

impl ParameterKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterKind::Int => value.is_i64() || value.is_u64(),
            //Integers are valid floats
            ParameterKind::Float => value.is_number(),
            ParameterKind::String => value.is_string(),
            ParameterKind::Bool => value.is_boolean(),
            ParameterKind::List => value.is_array(),
            ParameterKind::Dict => value.is_object(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Parameter {
    pub key: String,
    pub default: Value,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ResolvedParameter {
    pub key: String,
    pub value: Value,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
}

/// Parameters of one function after defaults and overrides have been applied.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FunctionParameters {
    pub function: String,
    pub parameters: Vec<ResolvedParameter>,
}

/// Per-function parameter overrides, keyed by function name then parameter key.
pub type ParameterOverrides = HashMap<String, HashMap<String, Value>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    First,
    Middle,
    Last,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AlgorithmFunction {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub run_first: bool,
    #[serde(default)]
    pub run_last: bool,
    #[serde(default)]
    pub parallel: bool,
}

impl AlgorithmFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            run_first: false,
            run_last: false,
            parallel: false,
        }
    }

    pub fn first(mut self) -> Self {
        self.run_first = true;
        self
    }

    pub fn last(mut self) -> Self {
        self.run_last = true;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, default: Value, kind: ParameterKind) -> Self {
        self.parameters.push(Parameter {
            key: key.into(),
            default,
            kind,
        });
        self
    }

    pub fn stage(&self) -> Stage {
        if self.run_first {
            Stage::First
        } else if self.run_last {
            Stage::Last
        } else {
            Stage::Middle
        }
    }

    fn defaults(&self) -> Vec<ResolvedParameter> {
        self.parameters
            .iter()
            .map(|param| ResolvedParameter {
                key: param.key.clone(),
                value: param.default.clone(),
                kind: param.kind,
            })
            .collect()
    }
}

/// Shape of an algorithm on the wire, checked on the way into [Algorithm].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AlgorithmDescriptor {
    pub functions: Vec<AlgorithmFunction>,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "AlgorithmDescriptor")]
pub struct Algorithm {
    functions: Vec<AlgorithmFunction>,
    namespaces: Vec<String>,
}

impl TryFrom<AlgorithmDescriptor> for Algorithm {
    type Error = AlgorithmError;

    fn try_from(value: AlgorithmDescriptor) -> Result<Self, Self::Error> {
        Algorithm::new(value.functions, value.namespaces)
    }
}

impl Algorithm {
    pub fn new(functions: Vec<AlgorithmFunction>, namespaces: Vec<String>) -> Result<Self, AlgorithmError> {
        let mut seen = HashSet::new();
        for function in &functions {
            if function.run_first && function.run_last {
                return Err(AlgorithmError::FirstAndLast {
                    name: function.name.clone(),
                });
            }
            if !seen.insert(function.name.as_str()) {
                return Err(AlgorithmError::DuplicateFunction {
                    name: function.name.clone(),
                });
            }
            for param in &function.parameters {
                if !param.kind.accepts(&param.default) {
                    return Err(AlgorithmError::ParameterType {
                        function: function.name.clone(),
                        key: param.key.clone(),
                        kind: param.kind,
                        value: param.default.clone(),
                    });
                }
            }
        }
        Ok(Self {
            functions,
            namespaces,
        })
    }

    pub fn functions(&self) -> &[AlgorithmFunction] {
        &self.functions
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Functions grouped into run order: first, middle, last. Declared order is kept within a
    /// group.
    pub fn stages(&self) -> [Vec<&AlgorithmFunction>; 3] {
        let mut stages: [Vec<&AlgorithmFunction>; 3] = Default::default();
        for function in &self.functions {
            let pos = match function.stage() {
                Stage::First => 0,
                Stage::Middle => 1,
                Stage::Last => 2,
            };
            stages[pos].push(function);
        }
        stages
    }

    /// Declared defaults for every function.
    pub fn defaults(&self) -> Vec<FunctionParameters> {
        self.functions
            .iter()
            .map(|function| FunctionParameters {
                function: function.name.clone(),
                parameters: function.defaults(),
            })
            .collect()
    }

    /// Applies `overrides` on top of the defaults, each value is checked against the declared
    /// type.
    pub fn resolve(&self, overrides: &ParameterOverrides) -> Result<Vec<FunctionParameters>, AlgorithmError> {
        for (name, values) in overrides {
            let function = self
                .functions
                .iter()
                .find(|function| &function.name == name)
                .ok_or_else(|| AlgorithmError::UnknownFunction { name: name.clone() })?;
            for key in values.keys() {
                if !function.parameters.iter().any(|param| &param.key == key) {
                    return Err(AlgorithmError::UnknownParameter {
                        function: name.clone(),
                        key: key.clone(),
                    });
                }
            }
        }

        let mut resolved = self.defaults();
        for entry in resolved.iter_mut() {
            let Some(values) = overrides.get(&entry.function) else {
                continue;
            };
            for param in entry.parameters.iter_mut() {
                if let Some(value) = values.get(&param.key) {
                    if !param.kind.accepts(value) {
                        return Err(AlgorithmError::ParameterType {
                            function: entry.function.clone(),
                            key: param.key.clone(),
                            kind: param.kind,
                            value: value.clone(),
                        });
                    }
                    param.value = value.clone();
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn algorithm() -> Algorithm {
        Algorithm::new(
            vec![
                AlgorithmFunction::new("rebalance").last(),
                AlgorithmFunction::new("signal")
                    .parallel()
                    .with_parameter("window", json!(20), ParameterKind::Int),
                AlgorithmFunction::new("load").first(),
                AlgorithmFunction::new("risk"),
            ],
            vec!["signals".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_that_function_cannot_be_first_and_last() {
        let res = Algorithm::new(vec![AlgorithmFunction::new("bad").first().last()], vec![]);
        assert!(matches!(res, Err(AlgorithmError::FirstAndLast { .. })));
    }

    #[test]
    fn test_that_duplicate_names_are_rejected() {
        let res = Algorithm::new(
            vec![AlgorithmFunction::new("a"), AlgorithmFunction::new("a")],
            vec![],
        );
        assert!(matches!(res, Err(AlgorithmError::DuplicateFunction { .. })));
    }

    #[test]
    fn test_that_stages_ignore_declaration_order() {
        let algo = algorithm();
        let names: Vec<Vec<&str>> = algo
            .stages()
            .iter()
            .map(|stage| stage.iter().map(|f| f.name.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["load"], vec!["signal", "risk"], vec!["rebalance"]]);
    }

    #[test]
    fn test_that_overrides_replace_defaults() {
        let algo = algorithm();
        let mut overrides = ParameterOverrides::new();
        overrides.insert("signal".to_string(), HashMap::from([("window".to_string(), json!(50))]));

        let resolved = algo.resolve(&overrides).unwrap();
        let signal = resolved.iter().find(|f| f.function == "signal").unwrap();
        assert_eq!(signal.parameters[0].value, json!(50));
    }

    #[test]
    fn test_that_override_with_wrong_type_is_rejected() {
        let algo = algorithm();
        let mut overrides = ParameterOverrides::new();
        overrides.insert("signal".to_string(), HashMap::from([("window".to_string(), json!("wide"))]));

        let res = algo.resolve(&overrides);
        assert!(matches!(res, Err(AlgorithmError::ParameterType { .. })));
    }

    #[test]
    fn test_that_override_for_unknown_parameter_is_rejected() {
        let algo = algorithm();
        let mut overrides = ParameterOverrides::new();
        overrides.insert("risk".to_string(), HashMap::from([("limit".to_string(), json!(1))]));

        let res = algo.resolve(&overrides);
        assert!(matches!(res, Err(AlgorithmError::UnknownParameter { .. })));
    }

    #[test]
    fn test_that_invalid_descriptor_fails_to_deserialize() {
        let res: Result<Algorithm, _> = serde_json::from_value(json!({
            "functions": [{"name": "x", "run_first": true, "run_last": true}]
        }));
        assert!(res.is_err());
    }
}
