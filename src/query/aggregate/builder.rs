// Aggregation Builders
//
// Lowering of the three aggregate steps. Each registers the runtime
// aggregation over the aggregate record layout, maps the stored record to
// the visible result row and records the same mapping on the table's
// materialization, so the store can be read as the query emits it.

use std::sync::Arc;

use log::debug;

use crate::catalog::GenericRow;
use crate::query::aggregate::params::AggregateParams;
use crate::query::builder::{GroupedStreamHolder, GroupedTableHolder, KeyCodecFactory, PlanBuilder, PlanError, TableHolder};
use crate::query::materialization::MaterializationInfo;
use crate::query::plan::{AggregateStep, WindowExpression, WindowedAggregateStep};
use crate::runtime::{RecordContext, TableHandle, ValueMapper};

use super::params::ResultMapper;
use super::window_select::WindowSelectMapper;

fn result_value_mapper(mapper: ResultMapper) -> ValueMapper {
    Arc::new(move |_: &RecordContext<'_>, row: Option<GenericRow>| row.map(|r| mapper(&r)))
}

fn window_select_value_mapper(mapper: WindowSelectMapper) -> ValueMapper {
    Arc::new(move |ctx: &RecordContext<'_>, row: Option<GenericRow>| row.map(|r| mapper.apply(ctx.key.window(), r)))
}

/// Map the stored aggregate to the result row, on the pipeline and on the read path
fn finish(
    builder: &mut PlanBuilder<'_>,
    aggregated: TableHandle,
    params: &AggregateParams,
    store_name: String,
    window: Option<WindowExpression>,
) -> Result<TableHolder, PlanError> {
    let result_mapper = params.result_mapper();
    let mut handle = builder
        .topology()
        .map_table_values(aggregated, result_value_mapper(result_mapper.clone()))?;

    let mut materialization = MaterializationInfo::builder(
        store_name,
        params.aggregate_schema().clone(),
        window.map(|w| w.window_type()),
    )
    .map(result_mapper, params.schema().clone());

    // checked once here, never per record
    let window_select = params.window_select_mapper();
    if window.is_some() && window_select.has_selects() {
        handle = builder
            .topology()
            .map_table_values(handle, window_select_value_mapper(window_select.clone()))?;
        materialization = materialization.window_select(window_select.clone());
    }

    Ok(TableHolder {
        handle,
        schema: params.schema().clone(),
        key_codec: KeyCodecFactory::for_window(window.map(|w| w.window_info())),
        materialization: Some(materialization),
    })
}

pub fn build_aggregate(
    builder: &mut PlanBuilder<'_>,
    grouped: GroupedStreamHolder,
    step: &AggregateStep,
) -> Result<TableHolder, PlanError> {
    let params = AggregateParams::new(&grouped.schema, &step.non_aggregate_columns, &step.aggregations, false)?;
    let store_name = step.properties.context.store_name();
    debug!("Building aggregation {} into store {}", step.properties.context, store_name);

    let aggregated = builder
        .topology()
        .aggregate(grouped.handle, params.initializer(), params.aggregator(), &store_name)?;
    finish(builder, aggregated, &params, store_name, None)
}

pub fn build_windowed_aggregate(
    builder: &mut PlanBuilder<'_>,
    grouped: GroupedStreamHolder,
    step: &WindowedAggregateStep,
) -> Result<TableHolder, PlanError> {
    step.window.validate().map_err(PlanError::InvalidWindow)?;
    let params = AggregateParams::new(&grouped.schema, &step.non_aggregate_columns, &step.aggregations, true)?;
    let store_name = step.properties.context.store_name();
    debug!(
        "Building {} aggregation {} into store {}",
        step.window, step.properties.context, store_name
    );

    let merger = match step.window {
        WindowExpression::Session { .. } => Some(params.merger()),
        _ => None,
    };
    let aggregated = builder.topology().windowed_aggregate(
        grouped.handle,
        step.window,
        params.initializer(),
        params.aggregator(),
        merger,
        &store_name,
    )?;
    finish(builder, aggregated, &params, store_name, Some(step.window))
}

pub fn build_table_aggregate(
    builder: &mut PlanBuilder<'_>,
    grouped: GroupedTableHolder,
    step: &AggregateStep,
) -> Result<TableHolder, PlanError> {
    let params = AggregateParams::new(&grouped.schema, &step.non_aggregate_columns, &step.aggregations, false)?;
    let subtractor = params.undo_aggregator()?;
    let store_name = step.properties.context.store_name();
    debug!("Building table aggregation {} into store {}", step.properties.context, store_name);

    let aggregated = builder.topology().table_aggregate(
        grouped.handle,
        params.initializer(),
        params.aggregator(),
        subtractor,
        &store_name,
    )?;
    finish(builder, aggregated, &params, store_name, None)
}
