//! Aggregate slot layout, shared by the query encoder, the executor and
//! the result reader so all three agree on offsets.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AggKind {
    Count = 1,
    Sum = 2,
    Min = 3,
    Max = 4,
    Avg = 5,
    Stddev = 6,
    Cardinality = 7,
}

impl AggKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => AggKind::Count,
            2 => AggKind::Sum,
            3 => AggKind::Min,
            4 => AggKind::Max,
            5 => AggKind::Avg,
            6 => AggKind::Stddev,
            7 => AggKind::Cardinality,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Min => "min",
            AggKind::Max => "max",
            AggKind::Avg => "avg",
            AggKind::Stddev => "stddev",
            AggKind::Cardinality => "cardinality",
        }
    }

    /// Bytes of the final value in a response.
    pub fn result_size(&self) -> usize {
        match self {
            AggKind::Count => 4,
            _ => 8,
        }
    }

    /// Bytes of running state while executing.
    pub fn accumulator_size(&self) -> usize {
        match self {
            // sum + count
            AggKind::Avg => 16,
            // count + mean + m2
            AggKind::Stddev => 24,
            _ => 8,
        }
    }

    pub fn needs_numeric(&self) -> bool {
        !matches!(self, AggKind::Count | AggKind::Cardinality)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggSlot {
    pub kind: AggKind,
    pub result_offset: usize,
    pub acc_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggLayout {
    pub slots: Vec<AggSlot>,
    pub result_size: usize,
    pub acc_size: usize,
}

/// Offsets accumulate in declaration order.
pub fn agg_layout(kinds: impl IntoIterator<Item = AggKind>) -> AggLayout {
    let mut layout = AggLayout::default();
    for kind in kinds {
        layout.slots.push(AggSlot {
            kind,
            result_offset: layout.result_size,
            acc_offset: layout.acc_size,
        });
        layout.result_size += kind.result_size();
        layout.acc_size += kind.accumulator_size();
    }
    layout
}
