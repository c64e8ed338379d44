// Holders
//
// The compiled output of one plan step: a runtime handle, the step's output
// schema and how its keys are serialized. Holders are moved into the parent
// step's handler, so each is consumed exactly once.

use crate::catalog::LogicalSchema;
use crate::query::codec::KeyCodec;
use crate::query::materialization::MaterializationInfoBuilder;
use crate::query::plan::{Format, WindowInfo};
use crate::runtime::{GroupedStreamHandle, GroupedTableHandle, StreamHandle, TableHandle};

use super::PlanError;

/// Creates key codecs for a holder's key schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCodecFactory {
    Unwindowed,
    Windowed(WindowInfo),
}

impl KeyCodecFactory {
    pub fn for_window(window: Option<WindowInfo>) -> Self {
        match window {
            Some(info) => KeyCodecFactory::Windowed(info),
            None => KeyCodecFactory::Unwindowed,
        }
    }

    pub fn window(&self) -> Option<WindowInfo> {
        match self {
            KeyCodecFactory::Unwindowed => None,
            KeyCodecFactory::Windowed(info) => Some(*info),
        }
    }

    pub fn create(&self, format: Format, schema: &LogicalSchema) -> KeyCodec {
        KeyCodec::new(format, schema, self.window())
    }
}

pub struct StreamHolder {
    pub handle: StreamHandle,
    pub schema: LogicalSchema,
    pub key_codec: KeyCodecFactory,
}

pub struct TableHolder {
    pub handle: TableHandle,
    pub schema: LogicalSchema,
    pub key_codec: KeyCodecFactory,
    /// Present when the table is backed by a queryable aggregation store
    pub materialization: Option<MaterializationInfoBuilder>,
}

pub struct GroupedStreamHolder {
    pub handle: GroupedStreamHandle,
    pub schema: LogicalSchema,
}

pub struct GroupedTableHolder {
    pub handle: GroupedTableHandle,
    pub schema: LogicalSchema,
}

/// Output of a built step
pub enum Holder {
    Stream(StreamHolder),
    Table(TableHolder),
    GroupedStream(GroupedStreamHolder),
    GroupedTable(GroupedTableHolder),
}

impl Holder {
    pub fn kind(&self) -> &'static str {
        match self {
            Holder::Stream(_) => "stream",
            Holder::Table(_) => "table",
            Holder::GroupedStream(_) => "grouped stream",
            Holder::GroupedTable(_) => "grouped table",
        }
    }

    pub fn schema(&self) -> &LogicalSchema {
        match self {
            Holder::Stream(h) => &h.schema,
            Holder::Table(h) => &h.schema,
            Holder::GroupedStream(h) => &h.schema,
            Holder::GroupedTable(h) => &h.schema,
        }
    }

    fn shape_error(&self, step: &str, expected: &'static str) -> PlanError {
        PlanError::InvalidPlanShape {
            step: step.to_string(),
            expected,
            actual: self.kind(),
        }
    }

    /// Take the stream holder, or fail naming the step that received something else
    pub fn into_stream(self, step: &str) -> Result<StreamHolder, PlanError> {
        match self {
            Holder::Stream(h) => Ok(h),
            other => Err(other.shape_error(step, "stream")),
        }
    }

    pub fn into_table(self, step: &str) -> Result<TableHolder, PlanError> {
        match self {
            Holder::Table(h) => Ok(h),
            other => Err(other.shape_error(step, "table")),
        }
    }

    pub fn into_grouped_stream(self, step: &str) -> Result<GroupedStreamHolder, PlanError> {
        match self {
            Holder::GroupedStream(h) => Ok(h),
            other => Err(other.shape_error(step, "grouped stream")),
        }
    }

    pub fn into_grouped_table(self, step: &str) -> Result<GroupedTableHolder, PlanError> {
        match self {
            Holder::GroupedTable(h) => Ok(h),
            other => Err(other.shape_error(step, "grouped table")),
        }
    }
}
