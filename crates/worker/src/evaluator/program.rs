//! 模型源码的编译和求值
//!
//! 源码由若干段组成：必需的入口段（默认 `[model_fn]`）和可选的 `[constants]`。
//! 每行 `name = expression`，`#` 开头为注释。入口段中以 `_` 开头的名称是中间量，不输出。
//! 常量在编译期求值；入口段按顺序求值，可以引用场景字段、`index`、常量和前面的结果。

use montecarlo_domain::Scenario;
use montecarlo_errors::{SimulationError, SimulationResult};
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::HashMap;

use super::syntax::{parse_expression, BinaryOp, Expr, Function, UnaryOp};
use super::{EvaluatorPolicy, ModelFunction};

const CONSTANTS_SECTION: &str = "constants";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    fn as_number(self) -> f64 {
        match self {
            Value::Number(n) => n,
            Value::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    fn as_bool(self) -> bool {
        match self {
            Value::Number(n) => n != 0.0,
            Value::Bool(b) => b,
        }
    }

    fn to_json(self, name: &str) -> SimulationResult<JsonValue> {
        match self {
            Value::Bool(b) => Ok(JsonValue::Bool(b)),
            Value::Number(n) => Number::from_f64(n).map(JsonValue::Number).ok_or_else(|| {
                SimulationError::processing(format!("输出 {} 不是有限数值", name))
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct Statement {
    name: String,
    expr: Expr,
    line: usize,
}

/// 编译后的模型，可以在多个线程间共享
#[derive(Debug, Clone)]
pub struct CompiledModel {
    constants: HashMap<String, Value>,
    statements: Vec<Statement>,
}

fn compile_error(line: usize, message: impl std::fmt::Display) -> SimulationError {
    SimulationError::compilation(format!("第{}行: {}", line, message))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

impl CompiledModel {
    pub fn compile(source: &str, policy: &EvaluatorPolicy) -> SimulationResult<Self> {
        if source.len() > policy.max_source_bytes {
            return Err(SimulationError::compilation(format!(
                "模型源码过大: {} 字节，上限 {} 字节",
                source.len(),
                policy.max_source_bytes
            )));
        }

        let mut section: Option<String> = None;
        let mut saw_entry = false;
        let mut constants: HashMap<String, Value> = HashMap::new();
        let mut statements: Vec<Statement> = Vec::new();

        for (idx, raw) in source.lines().enumerate() {
            let line = idx + 1;
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }

            if let Some(header) = text.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or_else(|| compile_error(line, "段标题缺少 ']'"))?
                    .trim();
                if name == policy.entry_point {
                    saw_entry = true;
                } else if name != CONSTANTS_SECTION {
                    return Err(compile_error(line, format!("未知的段 [{}]", name)));
                }
                section = Some(name.to_string());
                continue;
            }

            let current = section
                .as_deref()
                .ok_or_else(|| compile_error(line, "语句必须位于某个段之内"))?;
            let (name, expr_text) = text
                .split_once('=')
                .ok_or_else(|| compile_error(line, "语句格式应为 name = expression"))?;
            let name = name.trim();
            if !is_identifier(name) {
                return Err(compile_error(line, format!("无效的名称 '{}'", name)));
            }
            let expr = parse_expression(expr_text, policy.max_depth)
                .map_err(|e| compile_error(line, e))?;

            if constants.len() + statements.len() >= policy.max_statements {
                return Err(compile_error(
                    line,
                    format!("语句数量超过上限 {}", policy.max_statements),
                ));
            }

            if current == CONSTANTS_SECTION {
                if constants.contains_key(name) {
                    return Err(compile_error(line, format!("常量 {} 重复定义", name)));
                }
                let scope = ConstantScope(&constants);
                let value = eval(&expr, &scope).map_err(|e| compile_error(line, e))?;
                constants.insert(name.to_string(), value);
            } else {
                if constants.contains_key(name) {
                    return Err(compile_error(line, format!("{} 与常量同名", name)));
                }
                if statements.iter().any(|s| s.name == name) {
                    return Err(compile_error(line, format!("{} 重复定义", name)));
                }
                statements.push(Statement {
                    name: name.to_string(),
                    expr,
                    line,
                });
            }
        }

        if !saw_entry {
            return Err(SimulationError::compilation(format!(
                "模型中没有入口段 [{}]",
                policy.entry_point
            )));
        }
        if !statements.iter().any(|s| !s.name.starts_with('_')) {
            return Err(SimulationError::compilation(format!(
                "入口段 [{}] 没有任何输出",
                policy.entry_point
            )));
        }

        Ok(Self {
            constants,
            statements,
        })
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.statements
            .iter()
            .map(|s| s.name.as_str())
            .filter(|name| !name.starts_with('_'))
            .collect()
    }
}

impl ModelFunction for CompiledModel {
    fn invoke(&self, scenario: &Scenario) -> SimulationResult<Map<String, JsonValue>> {
        let mut locals: HashMap<&str, Value> = HashMap::with_capacity(self.statements.len());
        let mut output = Map::new();

        for statement in &self.statements {
            let scope = ScenarioScope {
                locals: &locals,
                constants: &self.constants,
                scenario,
            };
            let value = eval(&statement.expr, &scope).map_err(|e| match e {
                SimulationError::Processing(msg) => SimulationError::processing(format!(
                    "{} (第{}行): {}",
                    statement.name, statement.line, msg
                )),
                other => other,
            })?;
            if !statement.name.starts_with('_') {
                output.insert(statement.name.clone(), value.to_json(&statement.name)?);
            }
            locals.insert(statement.name.as_str(), value);
        }
        Ok(output)
    }
}

trait Scope {
    fn lookup(&self, name: &str) -> SimulationResult<Value>;
}

struct ConstantScope<'a>(&'a HashMap<String, Value>);

impl Scope for ConstantScope<'_> {
    fn lookup(&self, name: &str) -> SimulationResult<Value> {
        self.0
            .get(name)
            .copied()
            .ok_or_else(|| SimulationError::processing(format!("未知常量 '{}'", name)))
    }
}

struct ScenarioScope<'a> {
    locals: &'a HashMap<&'a str, Value>,
    constants: &'a HashMap<String, Value>,
    scenario: &'a Scenario,
}

impl Scope for ScenarioScope<'_> {
    fn lookup(&self, name: &str) -> SimulationResult<Value> {
        if let Some(value) = self.locals.get(name) {
            return Ok(*value);
        }
        if let Some(value) = self.constants.get(name) {
            return Ok(*value);
        }
        match self.scenario.payload.get(name) {
            Some(JsonValue::Bool(b)) => Ok(Value::Bool(*b)),
            Some(JsonValue::Number(n)) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| SimulationError::processing(format!("字段 {} 无法转换为数值", name))),
            Some(_) => Err(SimulationError::processing(format!(
                "字段 {} 不是数值或布尔值",
                name
            ))),
            None if name == "index" => Ok(Value::Number(self.scenario.index as f64)),
            None => Err(SimulationError::processing(format!("未知变量 '{}'", name))),
        }
    }
}

fn finite(value: f64, what: &str) -> SimulationResult<Value> {
    if value.is_finite() {
        Ok(Value::Number(value))
    } else {
        Err(SimulationError::processing(format!("{} 的结果不是有限数值", what)))
    }
}

fn eval(expr: &Expr, scope: &dyn Scope) -> SimulationResult<Value> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Var(name) => scope.lookup(name),
        Expr::Unary(UnaryOp::Neg, inner) => Ok(Value::Number(-eval(inner, scope)?.as_number())),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!eval(inner, scope)?.as_bool())),
        Expr::Binary(BinaryOp::And, left, right) => {
            Ok(Value::Bool(eval(left, scope)?.as_bool() && eval(right, scope)?.as_bool()))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            Ok(Value::Bool(eval(left, scope)?.as_bool() || eval(right, scope)?.as_bool()))
        }
        Expr::Binary(op, left, right) => {
            let a = eval(left, scope)?.as_number();
            let b = eval(right, scope)?.as_number();
            binary(*op, a, b)
        }
        Expr::Call(function, args) => call(*function, args, scope),
    }
}

fn binary(op: BinaryOp, a: f64, b: f64) -> SimulationResult<Value> {
    match op {
        BinaryOp::Add => finite(a + b, "加法"),
        BinaryOp::Sub => finite(a - b, "减法"),
        BinaryOp::Mul => finite(a * b, "乘法"),
        BinaryOp::Div if b == 0.0 => Err(SimulationError::processing("除数为零")),
        BinaryOp::Div => finite(a / b, "除法"),
        BinaryOp::Rem if b == 0.0 => Err(SimulationError::processing("取模的除数为零")),
        BinaryOp::Rem => finite(a % b, "取模"),
        BinaryOp::Pow => finite(a.powf(b), "乘方"),
        BinaryOp::Eq => Ok(Value::Bool(a == b)),
        BinaryOp::Ne => Ok(Value::Bool(a != b)),
        BinaryOp::Lt => Ok(Value::Bool(a < b)),
        BinaryOp::Le => Ok(Value::Bool(a <= b)),
        BinaryOp::Gt => Ok(Value::Bool(a > b)),
        BinaryOp::Ge => Ok(Value::Bool(a >= b)),
        BinaryOp::And => Ok(Value::Bool(a != 0.0 && b != 0.0)),
        BinaryOp::Or => Ok(Value::Bool(a != 0.0 || b != 0.0)),
    }
}

fn call(function: Function, args: &[Expr], scope: &dyn Scope) -> SimulationResult<Value> {
    // if 只对选中的分支求值
    if function == Function::If {
        return if eval(&args[0], scope)?.as_bool() {
            eval(&args[1], scope)
        } else {
            eval(&args[2], scope)
        };
    }

    let values = args
        .iter()
        .map(|arg| eval(arg, scope).map(Value::as_number))
        .collect::<SimulationResult<Vec<f64>>>()?;
    let x = values[0];
    let result = match function {
        Function::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Function::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Function::Abs => x.abs(),
        Function::Sqrt if x < 0.0 => {
            return Err(SimulationError::processing("sqrt 的参数为负数"));
        }
        Function::Sqrt => x.sqrt(),
        Function::Exp => x.exp(),
        Function::Ln | Function::Log10 if x <= 0.0 => {
            return Err(SimulationError::processing(format!(
                "{} 的参数必须为正数",
                function.name()
            )));
        }
        Function::Ln => x.ln(),
        Function::Log10 => x.log10(),
        Function::Pow => x.powf(values[1]),
        Function::Floor => x.floor(),
        Function::Ceil => x.ceil(),
        Function::Round => x.round(),
        Function::Clamp => {
            let (lo, hi) = (values[1], values[2]);
            if lo > hi {
                return Err(SimulationError::processing("clamp 的下限大于上限"));
            }
            x.clamp(lo, hi)
        }
        Function::If => {
            if x != 0.0 {
                values[1]
            } else {
                values[2]
            }
        }
    };
    finite(result, function.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use montecarlo_domain::ScenarioSampler;
    use serde_json::json;

    fn policy() -> EvaluatorPolicy {
        EvaluatorPolicy::default()
    }

    fn scenario(payload: JsonValue) -> Scenario {
        let mut scenario = ScenarioSampler::new()
            .unwrap()
            .batch(7, 1, None)
            .remove(0);
        scenario.payload = payload.as_object().cloned().unwrap();
        scenario
    }

    #[test]
    fn test_compile_and_invoke() {
        let source = "\
# 简单的交通模型
[constants]
capacity = 100
half = capacity / 2

[model_fn]
_load = poisson * 10
utilization = _load / capacity
congested = utilization > 0.8 && bernoulli == 1
delay = if(congested, exp(utilization), 0)
row = index
";
        let model = CompiledModel::compile(source, &policy()).unwrap();
        assert_eq!(model.output_names(), vec!["utilization", "congested", "delay", "row"]);

        let output = model
            .invoke(&scenario(json!({ "poisson": 9, "bernoulli": 1 })))
            .unwrap();
        assert_eq!(output["utilization"], json!(0.9));
        assert_eq!(output["congested"], json!(true));
        assert_eq!(output["delay"], json!(0.9f64.exp()));
        assert_eq!(output["row"], json!(7.0));
        assert!(!output.contains_key("_load"));
    }

    #[test]
    fn test_missing_entry_section() {
        let err = CompiledModel::compile("[constants]\na = 1\n", &policy()).unwrap_err();
        assert!(matches!(err, SimulationError::Compilation(_)));
        assert!(err.to_string().contains("model_fn"));
    }

    #[test]
    fn test_custom_entry_point() {
        let policy = EvaluatorPolicy {
            entry_point: "simulate".to_string(),
            ..policy()
        };
        assert!(CompiledModel::compile("[simulate]\ny = 1\n", &policy).is_ok());
        assert!(CompiledModel::compile("[model_fn]\ny = 1\n", &policy).is_err());
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = CompiledModel::compile("[model_fn]\na = 1\nb = (a +\n", &policy()).unwrap_err();
        assert!(matches!(err, SimulationError::Compilation(_)));
        assert!(err.to_string().contains("第3行"));
    }

    #[test]
    fn test_structural_errors() {
        for source in [
            "y = 1\n[model_fn]\nz = 2\n",
            "[model_fn]\nnot a statement\n",
            "[model_fn]\n1x = 2\n",
            "[model_fn]\ny = 1\ny = 2\n",
            "[constants]\nk = 1\n[model_fn]\nk = 2\n",
            "[imports]\nos = 1\n[model_fn]\ny = 1\n",
            "[model_fn]\n_only = 1\n",
            "[constants]\nk = missing\n[model_fn]\ny = k\n",
            "[model_fn\ny = 1\n",
        ] {
            let err = CompiledModel::compile(source, &policy()).unwrap_err();
            assert!(
                matches!(err, SimulationError::Compilation(_)),
                "{:?} for {:?}",
                err,
                source
            );
        }
    }

    #[test]
    fn test_sandbox_limits() {
        let tight = EvaluatorPolicy {
            max_source_bytes: 16,
            ..policy()
        };
        assert!(CompiledModel::compile("[model_fn]\nvalue = 1 + 2 + 3\n", &tight).is_err());

        let few = EvaluatorPolicy {
            max_statements: 2,
            ..policy()
        };
        assert!(CompiledModel::compile("[model_fn]\na = 1\nb = 2\n", &few).is_ok());
        assert!(CompiledModel::compile("[model_fn]\na = 1\nb = 2\nc = 3\n", &few).is_err());

        let shallow = EvaluatorPolicy {
            max_depth: 4,
            ..policy()
        };
        assert!(CompiledModel::compile("[model_fn]\ny = -x + 2\n", &shallow).is_ok());
        let err = CompiledModel::compile("[model_fn]\ny = -(-(-(-(1))))\n", &shallow).unwrap_err();
        assert!(matches!(err, SimulationError::Compilation(_)));
        assert!(err.to_string().contains("第2行"));
    }

    #[test]
    fn test_runtime_errors_are_processing_errors() {
        let model = CompiledModel::compile(
            "[model_fn]\nratio = uniform / zero\n",
            &policy(),
        )
        .unwrap();
        let err = model
            .invoke(&scenario(json!({ "uniform": 1.0, "zero": 0 })))
            .unwrap_err();
        assert!(matches!(err, SimulationError::Processing(_)));
        assert!(err.to_string().contains("ratio"));

        let err = model.invoke(&scenario(json!({ "uniform": 1.0 }))).unwrap_err();
        assert!(err.to_string().contains("zero"));

        let model = CompiledModel::compile("[model_fn]\ny = sqrt(x)\n", &policy()).unwrap();
        assert!(model.invoke(&scenario(json!({ "x": -1.0 }))).is_err());
        let model = CompiledModel::compile("[model_fn]\ny = exp(x)\n", &policy()).unwrap();
        assert!(model.invoke(&scenario(json!({ "x": 1000.0 }))).is_err());
        let model = CompiledModel::compile("[model_fn]\ny = label\n", &policy()).unwrap();
        assert!(model.invoke(&scenario(json!({ "label": "text" }))).is_err());
    }

    #[test]
    fn test_functions() {
        let model = CompiledModel::compile(
            "[model_fn]\n\
             a = min(3, x, 5)\n\
             b = max(3, x, 5)\n\
             c = clamp(x, 0, 2)\n\
             d = pow(2, 10)\n\
             e = round(2.5) + floor(1.7) + ceil(1.2)\n\
             f = abs(-x) + ln(1) + log10(100)\n\
             g = 7 % 4\n\
             h = if(false, 1 / 0, 9)\n",
            &policy(),
        )
        .unwrap();
        let output = model.invoke(&scenario(json!({ "x": 4 }))).unwrap();
        assert_eq!(output["a"], json!(3.0));
        assert_eq!(output["b"], json!(5.0));
        assert_eq!(output["c"], json!(2.0));
        assert_eq!(output["d"], json!(1024.0));
        assert_eq!(output["e"], json!(6.0));
        assert_eq!(output["f"], json!(6.0));
        assert_eq!(output["g"], json!(3.0));
        assert_eq!(output["h"], json!(9.0));
    }
}
