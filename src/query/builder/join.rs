// Stream-Table Join
//
// Each stream record is joined with the table's current value for the same
// key. The joined value is laid out as the join schema describes it:
// ROWTIME, key copies, then the left value, then the right value. A left
// join with no matching table row fills the right side with NULLs.

use std::sync::Arc;

use crate::catalog::{DataValue, GenericRow, LogicalSchema};
use crate::runtime::{RecordContext, ValueJoiner};

use super::PlanError;

/// Both sides must be keyed by the same column types
pub fn check_join_keys(left: &LogicalSchema, right: &LogicalSchema) -> Result<(), PlanError> {
    let types = |schema: &LogicalSchema| schema.key().iter().map(|c| c.sql_type()).collect::<Vec<_>>();
    if types(left) != types(right) {
        return Err(PlanError::JoinKeyMismatch {
            left: left.to_string(),
            right: right.to_string(),
        });
    }
    Ok(())
}

pub fn value_joiner(right_width: usize) -> ValueJoiner {
    Arc::new(move |ctx: &RecordContext<'_>, left: &GenericRow, right: Option<&GenericRow>| {
        let mut values = Vec::with_capacity(1 + ctx.key.values().len() + left.len() + right_width);
        values.push(DataValue::Integer(ctx.timestamp));
        values.extend(ctx.key.values().iter().cloned());
        values.extend(left.values().iter().cloned());
        match right {
            Some(row) => values.extend(row.values().iter().cloned()),
            None => values.extend(std::iter::repeat(DataValue::Null).take(right_width)),
        }
        GenericRow::new(values)
    })
}
