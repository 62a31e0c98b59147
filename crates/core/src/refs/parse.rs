#![forbid(unsafe_code)]

use super::{ALL_VERSIONS, HEAD, MAIN_BRANCH, RANGE_SEPARATOR, RangeBound, Ref, RefError, RefTarget};

const MAX_BRANCH_LEN: usize = 64;
const MAX_TAG_LEN: usize = 50;

pub(super) fn parse_ref(text: &str) -> Result<Ref, RefError> {
    if text.is_empty() {
        return Err(RefError::Empty);
    }

    let mut parts = text.split(':');
    let first = parts.next().unwrap_or_default();
    let (branch, version) = match (parts.next(), parts.next()) {
        (None, _) => (MAIN_BRANCH, first),
        (Some(version), None) => (first, version),
        (Some(_), Some(_)) => return Err(RefError::TooManyColons),
    };

    validate_branch(branch)?;
    let target = parse_target(version)?;
    Ok(Ref::from_parts(branch.to_string(), target))
}

pub(super) fn validate_branch(branch: &str) -> Result<(), RefError> {
    if branch.is_empty() {
        return Err(RefError::EmptyBranch);
    }
    if is_number(branch) {
        return Err(RefError::NumericBranch);
    }
    if branch == HEAD || branch == ALL_VERSIONS || branch.len() > MAX_BRANCH_LEN {
        return Err(RefError::InvalidBranch);
    }
    let mut chars = branch.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '~');
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '~')) {
        return Err(RefError::InvalidBranch);
    }
    Ok(())
}

fn parse_target(version: &str) -> Result<RefTarget, RefError> {
    if version.is_empty() {
        return Err(RefError::EmptyVersion);
    }
    if let Some((start, end)) = version.split_once(RANGE_SEPARATOR) {
        let start = parse_bound(start)?;
        let end = parse_bound(end)?;
        validate_range(&start, &end)?;
        return Ok(RefTarget::Range { start, end });
    }
    if version == ALL_VERSIONS {
        return Ok(RefTarget::AllVersions);
    }
    Ok(match parse_bound(version)? {
        RangeBound::Head => RefTarget::Head,
        RangeBound::Version(v) => RefTarget::Version(v),
        RangeBound::Tag(t) => RefTarget::Tag(t),
    })
}

fn parse_bound(text: &str) -> Result<RangeBound, RefError> {
    if text.is_empty() {
        return Err(RefError::EmptyVersion);
    }
    if text.contains(RANGE_SEPARATOR) {
        return Err(RefError::NestedRange);
    }
    if text == ALL_VERSIONS {
        return Err(RefError::AllVersionsInRange);
    }
    if text == HEAD {
        return Ok(RangeBound::Head);
    }
    if is_number(text) {
        return text
            .parse::<u64>()
            .map(RangeBound::Version)
            .map_err(|_| RefError::InvalidVersion);
    }
    if is_valid_tag(text) {
        return Ok(RangeBound::Tag(text.to_string()));
    }
    Err(RefError::InvalidVersion)
}

pub(super) fn validate_range(start: &RangeBound, end: &RangeBound) -> Result<(), RefError> {
    if matches!(start, RangeBound::Head) {
        return Err(RefError::RangeStartsAtHead);
    }
    if let (RangeBound::Version(start), RangeBound::Version(end)) = (start, end)
        && start > end
    {
        return Err(RefError::RangeOutOfOrder {
            start: *start,
            end: *end,
        });
    }
    Ok(())
}

/// Tag names: `^[A-Za-z][A-Za-z0-9_-]{0,49}$`, never `HEAD`.
pub fn is_valid_tag(tag: &str) -> bool {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN || tag == HEAD {
        return false;
    }
    let mut chars = tag.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

fn is_number(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}
