use crate::catalog::{DataValue, GenericRow};
use crate::common::types::Window;
use crate::query::aggregate::function::AggregateFunction;

/// Fills WINDOWSTART / WINDOWEND result columns from the record's window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSelectMapper {
    /// (result column position, window bound function)
    selects: Vec<(usize, AggregateFunction)>,
}

impl WindowSelectMapper {
    /// `first_aggregate` is the result-row position of the first aggregate column
    pub fn new(first_aggregate: usize, functions: &[AggregateFunction]) -> Self {
        let selects = functions
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_window_bound())
            .map(|(i, f)| (first_aggregate + i, *f))
            .collect();
        WindowSelectMapper { selects }
    }

    pub fn has_selects(&self) -> bool {
        !self.selects.is_empty()
    }

    pub fn apply(&self, window: Option<Window>, mut row: GenericRow) -> GenericRow {
        let Some(window) = window else {
            return row;
        };
        for (index, function) in &self.selects {
            let bound = match function {
                AggregateFunction::WindowStart => window.start,
                _ => window.end,
            };
            row.set(*index, DataValue::Integer(bound));
        }
        row
    }
}
