// Sink Builder
//
// Writes a stream to its output topic. The value written never repeats the
// key: ROWTIME and key copies are stripped from every row before it is
// serialized. Tombstones stay tombstones.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::catalog::{GenericRow, LogicalSchema};
use crate::query::builder::{KeyCodecFactory, PlanError};
use crate::query::codec::ValueCodec;
use crate::query::plan::Formats;
use crate::runtime::{RecordContext, SinkSpec, StreamHandle, TopologyBuilder, ValueMapper};

/// Positions of value columns that are ROWTIME or copies of key columns
pub fn implicit_and_key_column_indexes_in_value(schema: &LogicalSchema) -> BTreeSet<usize> {
    schema
        .value()
        .iter()
        .enumerate()
        .filter(|(_, column)| schema.is_meta_or_key_copy(column))
        .map(|(i, _)| i)
        .collect()
}

/// Drop the given positions from a row; `None` passes through
pub fn strip_columns(indexes: &BTreeSet<usize>, row: Option<GenericRow>) -> Option<GenericRow> {
    let row = row?;
    if indexes.is_empty() {
        return Some(row);
    }
    let values = row
        .into_values()
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !indexes.contains(i))
        .map(|(_, v)| v)
        .collect();
    Some(GenericRow::new(values))
}

/// Register the strip stage and the topic sink for `stream`
pub fn build_sink(
    topology: &mut dyn TopologyBuilder,
    stream: StreamHandle,
    schema: &LogicalSchema,
    key_codec: KeyCodecFactory,
    formats: &Formats,
    topic: &str,
) -> Result<(), PlanError> {
    let indexes = implicit_and_key_column_indexes_in_value(schema);
    let physical = schema.without_meta_and_key_cols_in_value();

    let stripper: ValueMapper = Arc::new(move |_: &RecordContext<'_>, row: Option<GenericRow>| strip_columns(&indexes, row));
    let stripped = topology.map_values(stream, stripper)?;

    topology.sink_to(
        stripped,
        SinkSpec {
            topic: topic.to_string(),
            key_codec: key_codec.create(formats.key, &physical),
            value_codec: ValueCodec::new(formats.value, &physical, formats.options),
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataValue, SqlType};

    fn schema() -> LogicalSchema {
        LogicalSchema::builder()
            .key_column("K", SqlType::BigInt)
            .value_column("V1", SqlType::String)
            .value_column("V2", SqlType::Double)
            .build()
            .unwrap()
            .with_meta_and_key_cols_in_value()
    }

    #[test]
    fn test_key_copy_is_stripped() {
        let indexes = implicit_and_key_column_indexes_in_value(&schema());
        assert_eq!(indexes.into_iter().collect::<Vec<_>>(), vec![0, 1]);

        let row = GenericRow::new(vec![
            DataValue::Integer(100),
            DataValue::Integer(1),
            DataValue::Text("x".into()),
            DataValue::Float(2.5),
        ]);
        let stripped = strip_columns(&implicit_and_key_column_indexes_in_value(&schema()), Some(row)).unwrap();
        assert_eq!(stripped.values(), &[DataValue::Text("x".into()), DataValue::Float(2.5)]);
    }

    #[test]
    fn test_tombstone_passes_through() {
        let indexes = implicit_and_key_column_indexes_in_value(&schema());
        assert_eq!(strip_columns(&indexes, None), None);
    }
}
