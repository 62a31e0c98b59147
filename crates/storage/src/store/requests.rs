#![forbid(unsafe_code)]

use sv_core::refs::Ref;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateBranchRequest {
    pub collection: String,
    pub branch_id: String,
    /// Single-version ref on the parent branch (number, `HEAD` or tag).
    pub base: Ref,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteBranchRequest {
    pub collection: String,
    pub branch_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordMergeRequest {
    pub collection: String,
    pub branch_id: String,
    /// Version on `branch_id` that carries the merge.
    pub version: u64,
    pub source: Ref,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateTagRequest {
    pub collection: String,
    pub tag_id: String,
    /// Single-version ref; `HEAD` is pinned to the current head version.
    pub target: Ref,
    pub system: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteTagRequest {
    pub collection: String,
    pub tag_id: String,
}
