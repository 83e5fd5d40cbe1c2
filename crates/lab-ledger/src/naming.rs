use std::collections::HashSet;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no free uid left below {maxsize}")]
pub struct CapacityError {
    pub maxsize: usize,
}

/// Width of every uid produced for `maxsize`: the digit count of `maxsize - 1`.
pub fn uid_width(maxsize: usize) -> usize {
    maxsize.saturating_sub(1).to_string().len()
}

/// Returns the smallest counter in `[0, maxsize)` whose zero-padded form is not
/// in `existing`. `maxsize = 1000` yields `"000"` through `"999"`.
pub fn counter_naming_strategy<'a, I>(existing: I, maxsize: usize) -> Result<String, CapacityError>
where
    I: IntoIterator<Item = &'a str>,
{
    let taken: HashSet<&str> = existing.into_iter().collect();
    let width = uid_width(maxsize);
    (0..maxsize)
        .map(|n| format!("{:0width$}", n, width = width))
        .find(|candidate| !taken.contains(candidate.as_str()))
        .ok_or(CapacityError { maxsize })
}
