// Aggregate Parameters
//
// Everything an aggregation needs, derived once from the input schema, the
// non-aggregate columns and the aggregate calls:
//
//   aggregate record = [non-aggregate columns..., intermediate columns...]
//   result row       = [non-aggregate columns..., one column per call...]
//
// The aggregate record is what the state store holds. The result mapper
// turns it into the visible row, dropping scratch columns such as AVG's
// running sum and count.

use std::sync::Arc;

use crate::catalog::{DataValue, GenericRow, LogicalSchema, RowKey, SqlType};
use crate::query::aggregate::function::{AggregateCall, BoundAggregate};
use crate::query::aggregate::window_select::WindowSelectMapper;
use crate::query::builder::PlanError;
use crate::runtime::{Aggregator, Initializer, Merger};

/// Maps a stored aggregate record to its visible result row
pub type ResultMapper = Arc<dyn Fn(&GenericRow) -> GenericRow + Send + Sync>;

/// Name of the result column of the `index`th aggregate call
pub fn aggregate_column_name(index: usize) -> String {
    format!("AGG_{}", index)
}

fn intermediate_names(index: usize, width: usize) -> Vec<String> {
    match width {
        1 => vec![aggregate_column_name(index)],
        _ => vec![format!("AGG_{}_SUM", index), format!("AGG_{}_COUNT", index)],
    }
}

fn argument_type(input: &LogicalSchema, call: &AggregateCall) -> Result<Option<SqlType>, PlanError> {
    match &call.argument {
        None => Ok(None),
        Some(name) => input
            .find_value_column(name)
            .map(|c| Some(c.sql_type()))
            .ok_or_else(|| PlanError::UnknownColumn(name.clone())),
    }
}

/// Derive the (aggregate record schema, result schema) pair
pub fn aggregate_schemas(
    input: &LogicalSchema,
    non_aggregate_columns: &[String],
    calls: &[AggregateCall],
) -> Result<(LogicalSchema, LogicalSchema), PlanError> {
    let mut agg_builder = LogicalSchema::builder();
    let mut result_builder = LogicalSchema::builder();
    for key in input.key() {
        agg_builder = agg_builder.key_column(key.name(), key.sql_type());
        result_builder = result_builder.key_column(key.name(), key.sql_type());
    }
    for name in non_aggregate_columns {
        let column = input
            .find_value_column(name)
            .ok_or_else(|| PlanError::UnknownColumn(name.clone()))?;
        agg_builder = agg_builder.value_column(name.clone(), column.sql_type());
        result_builder = result_builder.value_column(name.clone(), column.sql_type());
    }
    for (i, call) in calls.iter().enumerate() {
        let arg = argument_type(input, call)?;
        let intermediate = call
            .function
            .intermediate_types(arg)
            .map_err(PlanError::UnsupportedAggregate)?;
        let result = call.function.result_type(arg).map_err(PlanError::UnsupportedAggregate)?;
        for (name, t) in intermediate_names(i, intermediate.len()).into_iter().zip(intermediate) {
            agg_builder = agg_builder.value_column(name, t);
        }
        result_builder = result_builder.value_column(aggregate_column_name(i), result);
    }
    Ok((agg_builder.build_allowing_key_copies()?, result_builder.build_allowing_key_copies()?))
}

/// Immutable aggregation parameters
#[derive(Clone)]
pub struct AggregateParams {
    non_aggregate_indexes: Arc<Vec<usize>>,
    aggregates: Arc<Vec<BoundAggregate>>,
    aggregate_schema: LogicalSchema,
    schema: LogicalSchema,
    window_select: WindowSelectMapper,
}

impl AggregateParams {
    /// Resolve the aggregation against its input. Window bound functions
    /// are only accepted when `windowed` is set.
    pub fn new(
        input: &LogicalSchema,
        non_aggregate_columns: &[String],
        calls: &[AggregateCall],
        windowed: bool,
    ) -> Result<Self, PlanError> {
        if calls.is_empty() {
            return Err(PlanError::UnsupportedAggregate("an aggregation needs at least one aggregate function".into()));
        }
        let (aggregate_schema, schema) = aggregate_schemas(input, non_aggregate_columns, calls)?;

        let mut non_aggregate_indexes = Vec::with_capacity(non_aggregate_columns.len());
        for name in non_aggregate_columns {
            non_aggregate_indexes.push(input.value_index(name)?);
        }

        let mut aggregates = Vec::with_capacity(calls.len());
        let mut offset = non_aggregate_columns.len();
        for call in calls {
            if call.function.is_window_bound() && !windowed {
                return Err(PlanError::UnsupportedAggregate(format!(
                    "{} can only be used in a windowed aggregation",
                    call.function
                )));
            }
            let arg_type = argument_type(input, call)?;
            let arg_index = match &call.argument {
                Some(name) => Some(input.value_index(name)?),
                None => None,
            };
            let width = call
                .function
                .intermediate_types(arg_type)
                .map_err(PlanError::UnsupportedAggregate)?
                .len();
            aggregates.push(BoundAggregate {
                function: call.function,
                arg_index,
                arg_type,
                offset,
                width,
            });
            offset += width;
        }

        let functions: Vec<_> = calls.iter().map(|c| c.function).collect();
        let window_select = WindowSelectMapper::new(non_aggregate_columns.len(), &functions);

        Ok(AggregateParams {
            non_aggregate_indexes: Arc::new(non_aggregate_indexes),
            aggregates: Arc::new(aggregates),
            aggregate_schema,
            schema,
            window_select,
        })
    }

    /// Layout of the record held in the state store
    pub fn aggregate_schema(&self) -> &LogicalSchema {
        &self.aggregate_schema
    }

    /// Layout of the visible result
    pub fn schema(&self) -> &LogicalSchema {
        &self.schema
    }

    pub fn window_select_mapper(&self) -> &WindowSelectMapper {
        &self.window_select
    }

    /// Whether every function can remove a previously added value
    pub fn supports_undo(&self) -> bool {
        self.aggregates.iter().all(|a| a.function.supports_undo())
    }

    pub fn initializer(&self) -> Initializer {
        let width = self.non_aggregate_indexes.len();
        let aggregates = self.aggregates.clone();
        Arc::new(move || {
            let mut values = vec![DataValue::Null; width];
            for aggregate in aggregates.iter() {
                values.extend(aggregate.initial_values());
            }
            GenericRow::new(values)
        })
    }

    pub fn aggregator(&self) -> Aggregator {
        let non_agg = self.non_aggregate_indexes.clone();
        let aggregates = self.aggregates.clone();
        Arc::new(move |_key: &RowKey, input: &GenericRow, agg: GenericRow| {
            let mut values = agg.into_values();
            for (i, index) in non_agg.iter().enumerate() {
                values[i] = input.get(*index).cloned().unwrap_or(DataValue::Null);
            }
            for aggregate in aggregates.iter() {
                aggregate.fold(input.values(), &mut values);
            }
            GenericRow::new(values)
        })
    }

    /// Removes a value from an aggregate. Fails unless every function supports undo.
    pub fn undo_aggregator(&self) -> Result<Aggregator, PlanError> {
        if let Some(unsupported) = self.aggregates.iter().find(|a| !a.function.supports_undo()) {
            return Err(PlanError::UnsupportedAggregate(format!(
                "{} is not supported in a table aggregation",
                unsupported.function
            )));
        }
        let aggregates = self.aggregates.clone();
        Ok(Arc::new(move |_key: &RowKey, input: &GenericRow, agg: GenericRow| {
            let mut values = agg.into_values();
            for aggregate in aggregates.iter() {
                aggregate.undo(input.values(), &mut values);
            }
            GenericRow::new(values)
        }))
    }

    /// Merges two session aggregates; non-aggregate columns come from the second
    pub fn merger(&self) -> Merger {
        let aggregates = self.aggregates.clone();
        Arc::new(move |_key: &RowKey, first: GenericRow, second: GenericRow| {
            let mut values = second.into_values();
            for aggregate in aggregates.iter() {
                aggregate.merge(first.values(), &mut values);
            }
            GenericRow::new(values)
        })
    }

    pub fn result_mapper(&self) -> ResultMapper {
        let width = self.non_aggregate_indexes.len();
        let aggregates = self.aggregates.clone();
        Arc::new(move |agg: &GenericRow| {
            let mut values: Vec<DataValue> = agg.values()[..width.min(agg.len())].to_vec();
            for aggregate in aggregates.iter() {
                values.push(aggregate.result(agg.values()));
            }
            GenericRow::new(values)
        })
    }
}
