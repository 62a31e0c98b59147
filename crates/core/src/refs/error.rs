#![forbid(unsafe_code)]

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefError {
    Empty,
    TooManyColons,
    EmptyBranch,
    InvalidBranch,
    NumericBranch,
    EmptyVersion,
    InvalidVersion,
    InvalidTag,
    AllVersionsInRange,
    NestedRange,
    RangeStartsAtHead,
    RangeOutOfOrder { start: u64, end: u64 },
}

impl RefError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "ref must not be empty",
            Self::TooManyColons => "ref contains more than one ':'",
            Self::EmptyBranch => "branch must not be empty",
            Self::InvalidBranch => "branch contains invalid characters",
            Self::NumericBranch => "branch must not be a number",
            Self::EmptyVersion => "version must not be empty",
            Self::InvalidVersion => "version is not HEAD, *, a number, a tag or a range",
            Self::InvalidTag => "tag does not match [A-Za-z][A-Za-z0-9_-]{0,49}",
            Self::AllVersionsInRange => "range bounds must not be *",
            Self::NestedRange => "range bounds must not be ranges",
            Self::RangeStartsAtHead => "range must not start at HEAD",
            Self::RangeOutOfOrder { .. } => "range start is after range end",
        }
    }
}

impl std::fmt::Display for RefError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RangeOutOfOrder { start, end } => {
                write!(f, "{} ({start} > {end})", self.message())
            }
            other => write!(f, "invalid ref: {}", other.message()),
        }
    }
}

impl std::error::Error for RefError {}
