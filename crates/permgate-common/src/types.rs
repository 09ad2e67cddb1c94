//! Permission configuration model and request-scoped security types

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Prefix of the sentinel that refers to the acting user, e.g. `$current_user.id`
pub const CURRENT_USER_PREFIX: &str = "$current_user.";

/// Operations that permissions are granted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    ViewAll,
    ModifyAll,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Create,
        Operation::Read,
        Operation::Update,
        Operation::Delete,
        Operation::ViewAll,
        Operation::ModifyAll,
    ];

    /// Parse an operation name (case-insensitive)
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Some(Operation::Create),
            "read" => Some(Operation::Read),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            "view_all" => Some(Operation::ViewAll),
            "modify_all" => Some(Operation::ModifyAll),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::ViewAll => "view_all",
            Operation::ModifyAll => "modify_all",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::parse(s).ok_or_else(|| Error::Unsupported(format!("unknown operation '{s}'")))
    }
}

/// Declarative permission configuration for one object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Object (record type) name, unique per configuration
    pub object: String,
    /// Roles allowed per operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_permissions: Option<BTreeMap<Operation, Vec<String>>>,
    /// Roles allowed to read / update individual fields
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_permissions: BTreeMap<String, FieldPermission>,
    /// Fields whose values are masked for roles outside `visible_to`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_masking: BTreeMap<String, FieldMask>,
    /// Record-level rules, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub record_rules: Vec<RecordRule>,
    /// Row-level security settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_level_security: Option<RowLevelSecurity>,
}

impl PermissionConfig {
    pub fn new(object: &str) -> Self {
        Self {
            object: object.to_string(),
            ..Default::default()
        }
    }

    /// Allow `roles` to perform `operation`
    #[must_use]
    pub fn allow(mut self, operation: Operation, roles: &[&str]) -> Self {
        self.object_permissions
            .get_or_insert_with(BTreeMap::new)
            .insert(operation, to_roles(roles));
        self
    }

    /// Set read / update roles for a field
    #[must_use]
    pub fn with_field(mut self, field: &str, read: Option<&[&str]>, update: Option<&[&str]>) -> Self {
        self.field_permissions.insert(
            field.to_string(),
            FieldPermission {
                read: read.map(to_roles),
                update: update.map(to_roles),
            },
        );
        self
    }

    /// Mask a field for every role outside `visible_to`
    #[must_use]
    pub fn with_mask(mut self, field: &str, mask_format: &str, visible_to: &[&str]) -> Self {
        self.field_masking.insert(
            field.to_string(),
            FieldMask {
                mask_format: mask_format.to_string(),
                visible_to: to_roles(visible_to),
            },
        );
        self
    }

    #[must_use]
    pub fn with_record_rule(mut self, rule: RecordRule) -> Self {
        self.record_rules.push(rule);
        self
    }

    #[must_use]
    pub fn with_row_level_security(mut self, rls: RowLevelSecurity) -> Self {
        self.row_level_security = Some(rls);
        self
    }

    /// Roles configured for an operation, if the object has an object-level block
    #[must_use]
    pub fn roles_for(&self, operation: Operation) -> Option<&[String]> {
        self.object_permissions
            .as_ref()
            .and_then(|perms| perms.get(&operation))
            .map(Vec::as_slice)
    }

    /// Whether row-level security is switched on for this object
    #[must_use]
    pub fn rls_enabled(&self) -> bool {
        self.row_level_security
            .as_ref()
            .is_some_and(|rls| rls.enabled)
    }
}

fn to_roles(roles: &[&str]) -> Vec<String> {
    roles.iter().map(|r| (*r).to_string()).collect()
}

/// Field-level role sets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldPermission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Vec<String>>,
}

impl FieldPermission {
    /// Role set governing `operation`; writes (create/update) share the update set
    #[must_use]
    pub fn roles_for(&self, operation: Operation) -> Option<&[String]> {
        match operation {
            Operation::Read => self.read.as_deref(),
            Operation::Create | Operation::Update => self.update.as_deref(),
            _ => None,
        }
    }
}

/// Masking rule for a single field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMask {
    pub mask_format: String,
    #[serde(default)]
    pub visible_to: Vec<String>,
}

/// A record-level rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRule {
    pub name: String,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub permissions: RecordRulePermissions,
    #[serde(default)]
    pub priority: i32,
}

impl RecordRule {
    pub fn new(name: &str, condition: Option<Condition>, permissions: RecordRulePermissions) -> Self {
        Self {
            name: name.to_string(),
            condition,
            permissions,
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Operations a record rule grants when its condition matches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRulePermissions {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub delete: bool,
}

impl RecordRulePermissions {
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn all() -> Self {
        Self {
            read: true,
            update: true,
            delete: true,
        }
    }

    /// Whether the rule covers `operation`; only read/update/delete are rule-governed
    #[must_use]
    pub fn allows(&self, operation: Operation) -> bool {
        match operation {
            Operation::Read => self.read,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
            _ => false,
        }
    }
}

/// Row-level security settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowLevelSecurity {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_rule: Option<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<RlsException>,
}

impl RowLevelSecurity {
    /// Whether any of `roles` holds a bypass exception
    #[must_use]
    pub fn bypassed_by(&self, roles: &[String]) -> bool {
        self.exceptions
            .iter()
            .any(|e| e.bypass && roles.iter().any(|r| r == &e.role))
    }

    /// First role-specific condition held by any of `roles`
    #[must_use]
    pub fn condition_for(&self, roles: &[String]) -> Option<&Condition> {
        self.exceptions
            .iter()
            .filter(|e| roles.iter().any(|r| r == &e.role))
            .find_map(|e| e.condition.as_ref())
    }
}

/// Per-role RLS exception
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RlsException {
    pub role: String,
    #[serde(default)]
    pub bypass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// A declarative condition over a record and the acting user.
///
/// A `null` condition is represented by `Option::None` at the use site and is
/// always true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Simple(SimpleCondition),
    /// Postfix expression of simple conditions and `and` / `or` tokens
    Complex { expression: Vec<ExpressionToken> },
    Formula { formula: String },
    Lookup {
        object: String,
        via: String,
        #[serde(default)]
        condition: Option<Box<Condition>>,
    },
}

impl Condition {
    pub fn simple(field: &str, operator: ComparisonOperator, value: Value) -> Self {
        Condition::Simple(SimpleCondition {
            field: field.to_string(),
            operator,
            value,
        })
    }

    pub fn formula(formula: &str) -> Self {
        Condition::Formula {
            formula: formula.to_string(),
        }
    }

    /// Condition kind, for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::Simple(_) => "simple",
            Condition::Complex { .. } => "complex",
            Condition::Formula { .. } => "formula",
            Condition::Lookup { .. } => "lookup",
        }
    }
}

/// `field OPERATOR value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleCondition {
    pub field: String,
    pub operator: ComparisonOperator,
    #[serde(default)]
    pub value: Value,
}

/// Comparison operators understood by simple conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "ends_with")]
    EndsWith,
    /// Any operator name not listed above; never matches
    #[serde(rename = "unknown", other)]
    Unknown,
}

/// Token of a postfix `complex` expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpressionToken {
    Operator(LogicalOperator),
    Condition(SimpleCondition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

/// If `value` is a `$current_user.<path>` sentinel, return the path
#[must_use]
pub fn current_user_path(value: &Value) -> Option<&str> {
    value.as_str().and_then(|s| s.strip_prefix(CURRENT_USER_PREFIX))
}

/// Dotted-path lookup (`a.b.c`) into a JSON value; numeric segments index arrays
#[must_use]
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// The acting user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Extra attributes addressable through `$current_user.<path>`
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl UserContext {
    pub fn new(id: &str, roles: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            roles: to_roles(roles),
            attributes: Map::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Role-set intersection test
    #[must_use]
    pub fn has_any_role(&self, roles: &[String]) -> bool {
        roles.iter().any(|r| self.has_role(r))
    }

    /// Add roles not already held
    pub fn merge_roles(&mut self, roles: &[String]) {
        for role in roles {
            if !self.has_role(role) {
                self.roles.push(role.clone());
            }
        }
    }

    /// JSON view used for `$current_user.<path>` resolution
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = self.attributes.clone();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert(
            "roles".to_string(),
            Value::Array(self.roles.iter().cloned().map(Value::String).collect()),
        );
        Value::Object(map)
    }
}

/// Per-request security context
#[derive(Debug, Clone)]
pub struct SecurityContext {
    pub user: Option<UserContext>,
    pub object_name: String,
    pub operation: Operation,
    pub record_id: Option<String>,
    pub record: Option<Value>,
    pub field: Option<String>,
}

impl SecurityContext {
    pub fn new(object_name: &str, operation: Operation) -> Self {
        Self {
            user: None,
            object_name: object_name.to_string(),
            operation,
            record_id: None,
            record: None,
            field: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    #[must_use]
    pub fn with_record_id(mut self, record_id: &str) -> Self {
        self.record_id = Some(record_id.to_string());
        self
    }

    #[must_use]
    pub fn with_record(mut self, record: Value) -> Self {
        self.record = Some(record);
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    /// Roles of the acting user (empty when anonymous)
    #[must_use]
    pub fn roles(&self) -> &[String] {
        self.user.as_ref().map_or(&[], |u| u.roles.as_slice())
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }
}

/// Outcome of a permission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheckResult {
    pub granted: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl PermissionCheckResult {
    pub fn grant(reason: impl Into<String>) -> Self {
        Self {
            granted: true,
            reason: reason.into(),
            rule: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: reason.into(),
            rule: None,
        }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: &str) -> Self {
        self.rule = Some(rule.to_string());
        self
    }
}
