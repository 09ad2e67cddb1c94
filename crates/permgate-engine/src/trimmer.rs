//! Query trimmer: narrows data-layer queries to the rows a user may see

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use permgate_common::error::{Result, TranslationError};
use permgate_common::types::{
    ComparisonOperator, Condition, ExpressionToken, LogicalOperator, Operation,
    PermissionConfig, SecurityContext, SimpleCondition, UserContext,
};

use crate::compiler::resolve_value;
use crate::filter::{Filter, FilterOp, Query, ResidualClause};
use crate::formula::formula_to_filter;
use crate::loader::PermissionLoader;

/// What to do with a condition the filter language cannot express
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationMode {
    /// Fail with `Error::Translation` and leave the query untouched
    Strict,
    /// Record the condition in `Query::residual` for post-query evaluation
    Defer,
}

struct Untranslatable {
    error: TranslationError,
    residual: ResidualClause,
}

/// Injects row-level security and record-rule filters into queries
pub struct QueryTrimmer {
    loader: Arc<PermissionLoader>,
}

impl QueryTrimmer {
    pub fn new(loader: Arc<PermissionLoader>) -> Self {
        Self { loader }
    }

    /// AND the row-level security filter for `ctx` into `query`
    ///
    /// # Errors
    /// `Error::Translation` when the governing condition cannot be expressed
    /// as a filter; store failures are propagated.
    pub async fn apply_row_level_security(
        &self,
        object: &str,
        query: &mut Query,
        ctx: &SecurityContext,
    ) -> Result<()> {
        self.apply_row_level_security_with(object, query, ctx, TranslationMode::Strict)
            .await
    }

    /// Row-level security with an explicit [`TranslationMode`]
    ///
    /// # Errors
    /// See [`QueryTrimmer::apply_row_level_security`].
    pub async fn apply_row_level_security_with(
        &self,
        object: &str,
        query: &mut Query,
        ctx: &SecurityContext,
        mode: TranslationMode,
    ) -> Result<()> {
        let Some(config) = self.loader.load(object).await? else {
            return Ok(());
        };
        let outcome = row_level_filter(&config, ctx.user.as_ref());
        settle(object, query, outcome, mode)
    }

    /// AND the disjunction of applicable record-rule conditions into `query`
    ///
    /// # Errors
    /// `Error::Translation` when a rule condition cannot be expressed as a
    /// filter; store failures are propagated.
    pub async fn apply_record_rules(
        &self,
        object: &str,
        query: &mut Query,
        ctx: &SecurityContext,
        operation: Operation,
    ) -> Result<()> {
        self.apply_record_rules_with(object, query, ctx, operation, TranslationMode::Strict)
            .await
    }

    /// Record rules with an explicit [`TranslationMode`]
    ///
    /// # Errors
    /// See [`QueryTrimmer::apply_record_rules`].
    pub async fn apply_record_rules_with(
        &self,
        object: &str,
        query: &mut Query,
        ctx: &SecurityContext,
        operation: Operation,
        mode: TranslationMode,
    ) -> Result<()> {
        let Some(config) = self.loader.load(object).await? else {
            return Ok(());
        };
        let outcome = record_rule_filter(&config, ctx.user.as_ref(), operation);
        settle(object, query, outcome, mode)
    }

    /// Whether the query can never match a row
    #[must_use]
    pub fn is_query_impossible(query: &Query) -> bool {
        query.filters.as_ref().is_some_and(Filter::is_impossible)
    }
}

fn settle(
    object: &str,
    query: &mut Query,
    outcome: std::result::Result<Option<Filter>, Untranslatable>,
    mode: TranslationMode,
) -> Result<()> {
    match outcome {
        Ok(None) => Ok(()),
        Ok(Some(filter)) => {
            debug!("Trimming {} query with {}", object, filter.to_value());
            query.and_filter(filter);
            Ok(())
        }
        Err(Untranslatable { error, residual }) => match mode {
            TranslationMode::Strict => Err(error.into()),
            TranslationMode::Defer => {
                warn!("Filtering {} results in memory: {}", object, error);
                query.residual.push(residual);
                Ok(())
            }
        },
    }
}

fn row_level_filter(
    config: &PermissionConfig,
    user: Option<&UserContext>,
) -> std::result::Result<Option<Filter>, Untranslatable> {
    let Some(rls) = config.row_level_security.as_ref().filter(|rls| rls.enabled) else {
        return Ok(None);
    };
    let Some(user) = user else {
        return Ok(Some(Filter::Impossible));
    };
    if rls.bypassed_by(&user.roles) {
        return Ok(None);
    }
    let Some(condition) = rls.condition_for(&user.roles).or(rls.default_rule.as_ref()) else {
        return Ok(None);
    };
    condition_to_filter(condition, Some(user))
        .map(Some)
        .map_err(|error| Untranslatable {
            error,
            residual: ResidualClause::All(condition.clone()),
        })
}

fn record_rule_filter(
    config: &PermissionConfig,
    user: Option<&UserContext>,
    operation: Operation,
) -> std::result::Result<Option<Filter>, Untranslatable> {
    let applicable: Vec<_> = config
        .record_rules
        .iter()
        .filter(|rule| rule.permissions.allows(operation))
        .collect();

    // An unconditional rule opens every row
    if applicable.is_empty() || applicable.iter().any(|rule| rule.condition.is_none()) {
        return Ok(None);
    }

    let conditions: Vec<&Condition> = applicable
        .iter()
        .filter_map(|rule| rule.condition.as_ref())
        .collect();
    let filters = conditions
        .iter()
        .map(|condition| condition_to_filter(condition, user))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|error| Untranslatable {
            error,
            residual: ResidualClause::Any(conditions.iter().map(|c| (*c).clone()).collect()),
        })?;
    Ok(Some(Filter::or(filters)))
}

/// Translate a condition into a filter, resolving `$current_user` sentinels
///
/// # Errors
/// `TranslationError` for formulas outside the translatable subset, unknown
/// operators and malformed complex expressions.
pub fn condition_to_filter(
    condition: &Condition,
    user: Option<&UserContext>,
) -> std::result::Result<Filter, TranslationError> {
    let user_value = user.map_or(Value::Null, UserContext::to_value);
    match condition {
        Condition::Simple(simple) => simple_to_filter(simple, &user_value),
        Condition::Complex { expression } => complex_to_filter(expression, &user_value),
        Condition::Formula { formula } => formula_to_filter(formula, user),
        Condition::Lookup {
            object,
            via,
            condition,
        } => {
            let inner = match condition {
                Some(inner) => condition_to_filter(inner, user)?,
                None => Filter::All,
            };
            Ok(Filter::Lookup {
                from: object.clone(),
                local_field: via.clone(),
                foreign_field: "id".to_string(),
                filter: Box::new(inner),
            })
        }
    }
}

fn simple_to_filter(
    simple: &SimpleCondition,
    user: &Value,
) -> std::result::Result<Filter, TranslationError> {
    let op = match simple.operator {
        ComparisonOperator::Eq => FilterOp::Eq,
        ComparisonOperator::Ne => FilterOp::Ne,
        ComparisonOperator::Gt => FilterOp::Gt,
        ComparisonOperator::Gte => FilterOp::Gte,
        ComparisonOperator::Lt => FilterOp::Lt,
        ComparisonOperator::Lte => FilterOp::Lte,
        ComparisonOperator::In => FilterOp::In,
        ComparisonOperator::NotIn => FilterOp::Nin,
        ComparisonOperator::Contains => FilterOp::Contains,
        ComparisonOperator::NotContains => FilterOp::NotContains,
        ComparisonOperator::StartsWith => FilterOp::StartsWith,
        ComparisonOperator::EndsWith => FilterOp::EndsWith,
        ComparisonOperator::Unknown => {
            return Err(TranslationError::UnsupportedOperator(format!(
                "unknown operator on field '{}'",
                simple.field
            )));
        }
    };
    Ok(Filter::compare(&simple.field, op, resolve_value(&simple.value, user)))
}

fn complex_to_filter(
    expression: &[ExpressionToken],
    user: &Value,
) -> std::result::Result<Filter, TranslationError> {
    let malformed = || TranslationError::UnsupportedFormula {
        formula: "<complex expression>".to_string(),
        reason: "malformed postfix expression".to_string(),
    };

    let mut stack: Vec<Filter> = Vec::new();
    for token in expression {
        match token {
            ExpressionToken::Condition(simple) => stack.push(simple_to_filter(simple, user)?),
            ExpressionToken::Operator(op) => {
                let (Some(right), Some(left)) = (stack.pop(), stack.pop()) else {
                    return Err(malformed());
                };
                stack.push(match op {
                    LogicalOperator::And => Filter::And(vec![left, right]),
                    LogicalOperator::Or => Filter::Or(vec![left, right]),
                });
            }
        }
    }
    match (stack.pop(), stack.is_empty()) {
        (Some(filter), true) => Ok(filter),
        _ => Err(malformed()),
    }
}
