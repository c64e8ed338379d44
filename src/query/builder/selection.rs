// Row Functions
//
// Closures for projections, filters and re-keying, built once per step from
// the step's expressions. Evaluation errors are record-level: they go to the
// step's processing logger and never stop the query.

use std::sync::Arc;

use crate::catalog::{DataValue, GenericRow, LogicalSchema, RowKey};
use crate::common::processing_log::ProcessingLogger;
use crate::query::expression::{BoundExpression, Expression};
use crate::query::plan::SelectExpression;
use crate::runtime::{KeySelector, RecordContext, RowPredicate, ValueMapper};

use super::PlanError;

struct BoundSelect {
    alias: String,
    text: String,
    expression: BoundExpression,
}

/// Projection: one output column per select expression. A column whose
/// expression fails evaluates to NULL.
pub fn select_mapper(
    schema: &LogicalSchema,
    selects: &[SelectExpression],
    logger: Arc<ProcessingLogger>,
) -> Result<ValueMapper, PlanError> {
    let mut bound = Vec::with_capacity(selects.len());
    for select in selects {
        bound.push(BoundSelect {
            alias: select.alias.clone(),
            text: select.expression.to_string(),
            expression: select.expression.bind(schema)?,
        });
    }

    Ok(Arc::new(move |_: &RecordContext<'_>, row: Option<GenericRow>| {
        let row = row?;
        let values = bound
            .iter()
            .enumerate()
            .map(|(i, select)| match select.expression.evaluate(&row) {
                Ok(value) => value,
                Err(e) => {
                    logger.error(
                        format!(
                            "Error computing expression {} for column {} with index {}: {}",
                            select.text, select.alias, i, e
                        ),
                        Some(row.to_string()),
                    );
                    DataValue::Null
                }
            })
            .collect();
        Some(GenericRow::new(values))
    }))
}

/// Filter: keeps rows the predicate evaluates to TRUE for
pub fn filter_predicate(
    schema: &LogicalSchema,
    predicate: &Expression,
    logger: Arc<ProcessingLogger>,
) -> Result<RowPredicate, PlanError> {
    let text = predicate.to_string();
    let bound = predicate.bind(schema)?;

    Ok(Arc::new(move |_: &RecordContext<'_>, row: &GenericRow| match bound.matches(row) {
        Ok(keep) => keep,
        Err(e) => {
            logger.error(format!("Error evaluating predicate {}: {}", text, e), Some(row.to_string()));
            false
        }
    }))
}

/// Re-keying for GROUP BY. Rows whose grouping values fail or are NULL are dropped.
pub fn group_by_selector(
    schema: &LogicalSchema,
    expressions: &[Expression],
    logger: Arc<ProcessingLogger>,
) -> Result<KeySelector, PlanError> {
    let mut bound = Vec::with_capacity(expressions.len());
    for expression in expressions {
        bound.push((expression.to_string(), expression.bind(schema)?));
    }

    Ok(Arc::new(move |_: &RecordContext<'_>, row: &GenericRow| {
        let mut values = Vec::with_capacity(bound.len());
        for (i, (text, expression)) in bound.iter().enumerate() {
            match expression.evaluate(row) {
                Ok(DataValue::Null) => {
                    logger.error(
                        format!(
                            "Group-by column {} with index {} resolved to null. The source row will be excluded.",
                            text, i
                        ),
                        Some(row.to_string()),
                    );
                    return None;
                }
                Ok(value) => values.push(value),
                Err(e) => {
                    logger.error(format!("Error computing group-by column {}: {}", text, e), Some(row.to_string()));
                    return None;
                }
            }
        }
        Some(RowKey::new(values))
    }))
}
