//! Rule compiler: declarative permission configuration to fast runtime rules

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use permgate_common::types::{
    current_user_path, lookup_path, ComparisonOperator, Condition, ExpressionToken,
    LogicalOperator, Operation, PermissionConfig, SimpleCondition,
};

use crate::bitmask::{ObjectPermissions, RecordPermissions};
use crate::expr::{loose_eq, CompareOp, Formula};

/// Compiled condition over `(record, user)`; the user is the JSON view from
/// [`permgate_common::UserContext::to_value`]
pub type RecordEvaluator = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Bit layout carried by a compiled rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionBitmask {
    Object(ObjectPermissions),
    Record(RecordPermissions),
}

/// Fast-evaluation form of one declarative rule
#[derive(Clone)]
pub struct CompiledPermissionRule {
    pub rule_name: String,
    pub permission_bitmask: PermissionBitmask,
    pub role_lookup: HashMap<Operation, Vec<String>>,
    pub evaluator: Option<RecordEvaluator>,
    pub priority: i32,
}

impl fmt::Debug for CompiledPermissionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPermissionRule")
            .field("rule_name", &self.rule_name)
            .field("permission_bitmask", &self.permission_bitmask)
            .field("role_lookup", &self.role_lookup)
            .field("evaluator", &self.evaluator.as_ref().map(|_| "<fn>"))
            .field("priority", &self.priority)
            .finish()
    }
}

impl CompiledPermissionRule {
    /// Bit test for `operation` in this rule's layout
    #[must_use]
    pub fn grants(&self, operation: Operation) -> bool {
        match self.permission_bitmask {
            PermissionBitmask::Object(bits) => bits.grants(operation),
            PermissionBitmask::Record(bits) => bits.grants(operation),
        }
    }

    /// Whether the rule's condition holds; rules without an evaluator always match
    #[must_use]
    pub fn matches(&self, record: &Value, user: &Value) -> bool {
        self.evaluator.as_ref().map_or(true, |eval| eval(record, user))
    }
}

/// All compiled rules for one object
#[derive(Debug, Clone, Default)]
pub struct CompiledRules {
    /// Rule for the `object_permissions` block, if any
    pub object: Option<CompiledPermissionRule>,
    /// Record rules, priority descending, ties in declaration order
    pub records: Vec<CompiledPermissionRule>,
}

impl CompiledRules {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.object.is_none() && self.records.is_empty()
    }

    /// Every rule, object-level first
    pub fn iter(&self) -> impl Iterator<Item = &CompiledPermissionRule> {
        self.object.iter().chain(self.records.iter())
    }
}

/// Turns [`PermissionConfig`] into [`CompiledRules`]; pure and deterministic
pub struct RuleCompiler;

impl RuleCompiler {
    /// Compile one object's configuration
    #[must_use]
    pub fn compile(config: &PermissionConfig) -> CompiledRules {
        let object = config.object_permissions.as_ref().map(|perms| {
            let mut bits = ObjectPermissions::empty();
            let mut role_lookup = HashMap::new();
            for (operation, roles) in perms {
                bits |= ObjectPermissions::from_operation(*operation);
                role_lookup.insert(*operation, roles.clone());
            }
            CompiledPermissionRule {
                rule_name: format!("{}:object_permissions", config.object),
                permission_bitmask: PermissionBitmask::Object(bits),
                role_lookup,
                evaluator: None,
                priority: 0,
            }
        });

        let mut records: Vec<CompiledPermissionRule> = config
            .record_rules
            .iter()
            .map(|rule| CompiledPermissionRule {
                rule_name: rule.name.clone(),
                permission_bitmask: PermissionBitmask::Record(RecordPermissions::from(
                    &rule.permissions,
                )),
                role_lookup: HashMap::new(),
                evaluator: Some(Self::compile_condition(rule.condition.as_ref())),
                priority: rule.priority,
            })
            .collect();
        // sort_by is stable, so equal priorities keep declaration order
        records.sort_by(|a, b| b.priority.cmp(&a.priority));

        CompiledRules { object, records }
    }

    /// Compile a condition into an evaluator; `None` always matches
    #[must_use]
    pub fn compile_condition(condition: Option<&Condition>) -> RecordEvaluator {
        match condition {
            None | Some(Condition::Lookup { .. }) => Arc::new(|_, _| true),
            Some(Condition::Simple(simple)) => {
                let simple = simple.clone();
                Arc::new(move |record, user| evaluate_simple(&simple, record, user))
            }
            Some(Condition::Complex { expression }) => {
                if !is_well_formed_postfix(expression) {
                    warn!("Malformed complex condition; it will never match");
                    return Arc::new(|_, _| false);
                }
                let expression = expression.clone();
                Arc::new(move |record, user| evaluate_postfix(&expression, record, user))
            }
            Some(Condition::Formula { formula }) => match Formula::parse(formula) {
                Ok(parsed) => Arc::new(move |record, user| parsed.evaluate(record, user)),
                Err(e) => {
                    warn!("Formula '{}' failed to parse, denying: {}", formula, e);
                    Arc::new(|_, _| false)
                }
            },
        }
    }
}

/// Resolve `$current_user.<path>` sentinels (including inside arrays)
#[must_use]
pub fn resolve_value(value: &Value, user: &Value) -> Value {
    if let Some(path) = current_user_path(value) {
        return lookup_path(user, path).cloned().unwrap_or(Value::Null);
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, user)).collect()),
        other => other.clone(),
    }
}

/// Evaluate a simple condition against a record
#[must_use]
pub fn evaluate_simple(condition: &SimpleCondition, record: &Value, user: &Value) -> bool {
    let expected = resolve_value(&condition.value, user);
    let actual = lookup_path(record, &condition.field);
    apply_operator(condition.operator, actual, &expected)
}

fn apply_operator(operator: ComparisonOperator, actual: Option<&Value>, expected: &Value) -> bool {
    let expected_ref = Some(expected);
    match operator {
        ComparisonOperator::Eq => CompareOp::Eq.apply(actual, expected_ref),
        ComparisonOperator::Ne => CompareOp::Ne.apply(actual, expected_ref),
        ComparisonOperator::Gt => CompareOp::Gt.apply(actual, expected_ref),
        ComparisonOperator::Gte => CompareOp::Gte.apply(actual, expected_ref),
        ComparisonOperator::Lt => CompareOp::Lt.apply(actual, expected_ref),
        ComparisonOperator::Lte => CompareOp::Lte.apply(actual, expected_ref),
        ComparisonOperator::In => is_member(actual, expected),
        ComparisonOperator::NotIn => !is_member(actual, expected),
        ComparisonOperator::Contains => contains(actual, expected),
        ComparisonOperator::NotContains => !contains(actual, expected),
        ComparisonOperator::StartsWith => match (actual, expected) {
            (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        ComparisonOperator::EndsWith => match (actual, expected) {
            (Some(Value::String(s)), Value::String(suffix)) => s.ends_with(suffix.as_str()),
            _ => false,
        },
        ComparisonOperator::Unknown => false,
    }
}

fn is_member(actual: Option<&Value>, expected: &Value) -> bool {
    match expected {
        Value::Array(items) => items.iter().any(|item| loose_eq(actual, Some(item))),
        single => loose_eq(actual, Some(single)),
    }
}

fn contains(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
        (Some(Value::Array(items)), needle) => items.iter().any(|item| loose_eq(Some(item), Some(needle))),
        _ => false,
    }
}

fn is_well_formed_postfix(expression: &[ExpressionToken]) -> bool {
    let mut depth: usize = 0;
    for token in expression {
        match token {
            ExpressionToken::Condition(_) => depth += 1,
            ExpressionToken::Operator(_) => {
                if depth < 2 {
                    return false;
                }
                depth -= 1;
            }
        }
    }
    depth == 1
}

fn evaluate_postfix(expression: &[ExpressionToken], record: &Value, user: &Value) -> bool {
    let mut stack: Vec<bool> = Vec::with_capacity(expression.len());
    for token in expression {
        match token {
            ExpressionToken::Condition(simple) => stack.push(evaluate_simple(simple, record, user)),
            ExpressionToken::Operator(op) => {
                let (Some(right), Some(left)) = (stack.pop(), stack.pop()) else {
                    return false;
                };
                stack.push(match op {
                    LogicalOperator::And => left && right,
                    LogicalOperator::Or => left || right,
                });
            }
        }
    }
    stack.len() == 1 && stack[0]
}
