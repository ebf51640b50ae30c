use shared::protocol::BoundInput;
use thiserror::Error;

pub const DEFAULT_MAX_BOUND: i64 = 1_000_000_000;
/// Ceiling on the nodes an addFactory request may create.
pub const DEFAULT_MAX_INITIAL_CHILDREN: i64 = 10_000;

pub const INVALID_NAME: &str = "There is a problem with the factory name";
pub const NON_INTEGER_BOUNDS: &str = "Children bounds must be whole numbers";
pub const INVERTED_BOUNDS: &str =
    "Children upper bound must be greater than or equal to lower bound";

/// A rejected factory mutation. The message is shown to the user verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Factory fields exactly as the client sent them.
#[derive(Debug, Clone, Copy)]
pub struct FactoryInput<'a> {
    pub name: &'a str,
    pub lower_bound: &'a BoundInput,
    pub upper_bound: &'a BoundInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidFactory {
    pub name: String,
    pub lower_bound: i64,
    pub upper_bound: i64,
}

pub fn out_of_bounds_message(max_bound: i64) -> String {
    format!(
        "Children bounds are... out of bounds!  Please ensure they are within {} to {}",
        max_bound.saturating_neg(),
        max_bound
    )
}

/// Checks a factory add/edit request. Rules run in order and the first
/// failure wins: name, integer coercion, magnitude, ordering.
pub fn validate(
    input: FactoryInput<'_>,
    max_bound: i64,
) -> Result<ValidFactory, ValidationError> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(ValidationError(INVALID_NAME.to_string()));
    }

    let (Some(lower_bound), Some(upper_bound)) =
        (input.lower_bound.coerce(), input.upper_bound.coerce())
    else {
        return Err(ValidationError(NON_INTEGER_BOUNDS.to_string()));
    };

    if lower_bound < max_bound.saturating_neg() || upper_bound > max_bound {
        return Err(ValidationError(out_of_bounds_message(max_bound)));
    }

    if upper_bound < lower_bound {
        return Err(ValidationError(INVERTED_BOUNDS.to_string()));
    }

    Ok(ValidFactory {
        name: name.to_string(),
        lower_bound,
        upper_bound,
    })
}

/// Number of children to create for a new factory. Negative requests create
/// none; requests above `max_initial_children` are rejected before anything
/// is allocated.
pub fn initial_child_count(
    num_children: i64,
    max_initial_children: i64,
) -> Result<usize, ValidationError> {
    if num_children > max_initial_children {
        return Err(ValidationError(format!(
            "Number of children must be at most {max_initial_children}"
        )));
    }
    Ok(usize::try_from(num_children).unwrap_or(0))
}

#[cfg(test)]
#[path = "tests/validation_tests.rs"]
mod tests;
