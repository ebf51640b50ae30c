//! The four client-initiated tree mutations.
//!
//! Each operation validates, persists, and reports an [`Outcome`] telling the
//! caller which notification path to take. Steps within one operation run in
//! order: validate, persist, regenerate when needed. Concurrent operations are
//! not serialized here; the store's transactions are the only consistency
//! mechanism, so an edit racing a delete of the same factory may find the row
//! gone and become a no-op. An edit's update and regeneration share one
//! transaction.

use shared::{
    domain::{Factory, FactoryId},
    error::{ApiError, ErrorCode},
    protocol::{
        AddFactoryRequest, DeleteFactoryRequest, EditFactoryRequest, RegenFactoryNodesRequest,
    },
};
use storage::StorageError;
use tracing::{debug, info};

use crate::{
    random::random_in_range,
    regenerate::regenerate,
    validation::{initial_child_count, validate, FactoryInput},
    ApiContext,
};

/// Smallest child count accepted by a regeneration request.
pub const MIN_REGEN_CHILDREN: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A mutation was committed; every session must receive the new tree.
    Committed,
    /// The request failed validation; only the sender is told.
    Invalid(String),
    /// The request was dropped without touching storage.
    Ignored(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    FactoryNotFound(FactoryId),
    ChildCountOutOfRange { requested: i64, min: i64, max: i64 },
}

impl Rejection {
    pub fn to_api_error(&self) -> ApiError {
        match self {
            Self::FactoryNotFound(id) => {
                ApiError::new(ErrorCode::NotFound, format!("factory {} not found", id.0))
            }
            Self::ChildCountOutOfRange {
                requested,
                min,
                max,
            } => ApiError::new(
                ErrorCode::Rejected,
                format!("number of children {requested} is outside {min} to {max}"),
            ),
        }
    }
}

pub async fn add_factory(
    ctx: &ApiContext,
    request: AddFactoryRequest,
) -> Result<Outcome, StorageError> {
    let valid = match validate(
        FactoryInput {
            name: &request.name,
            lower_bound: &request.lower_bound,
            upper_bound: &request.upper_bound,
        },
        ctx.config.max_bound,
    ) {
        Ok(valid) => valid,
        Err(err) => return Ok(Outcome::Invalid(err.0)),
    };
    let count = match initial_child_count(request.num_children, ctx.config.max_initial_children) {
        Ok(count) => count,
        Err(err) => return Ok(Outcome::Invalid(err.0)),
    };

    let values = (0..count)
        .map(|_| random_in_range(valid.lower_bound, valid.upper_bound))
        .collect::<Vec<_>>();

    let factory: Factory = ctx
        .storage
        .create_factory(&valid.name, valid.lower_bound, valid.upper_bound, &values)
        .await?;
    info!(
        factory_id = factory.id.0,
        name = %factory.name,
        lower_bound = factory.lower_bound,
        upper_bound = factory.upper_bound,
        nodes = factory.nodes.len(),
        "factory created"
    );
    Ok(Outcome::Committed)
}

pub async fn edit_factory(
    ctx: &ApiContext,
    request: EditFactoryRequest,
) -> Result<Outcome, StorageError> {
    let valid = match validate(
        FactoryInput {
            name: &request.name,
            lower_bound: &request.lower_bound,
            upper_bound: &request.upper_bound,
        },
        ctx.config.max_bound,
    ) {
        Ok(valid) => valid,
        Err(err) => return Ok(Outcome::Invalid(err.0)),
    };

    let edit = match ctx
        .storage
        .edit_factory(
            request.id,
            &valid.name,
            valid.lower_bound,
            valid.upper_bound,
            random_in_range,
        )
        .await
    {
        Ok(edit) => edit,
        Err(err) if err.is_not_found() => {
            return Ok(Outcome::Ignored(Rejection::FactoryNotFound(request.id)))
        }
        Err(err) => return Err(err),
    };
    info!(
        factory_id = edit.factory.id.0,
        name = %edit.factory.name,
        lower_bound = edit.factory.lower_bound,
        upper_bound = edit.factory.upper_bound,
        "factory updated"
    );
    if edit.strays > 0 {
        debug!(
            factory_id = edit.factory.id.0,
            stray = edit.strays,
            regenerated = edit.regenerated.len(),
            "nodes fell outside new bounds"
        );
    }
    Ok(Outcome::Committed)
}

pub async fn delete_factory(
    ctx: &ApiContext,
    request: DeleteFactoryRequest,
) -> Result<Outcome, StorageError> {
    match ctx.storage.delete_factory(request.id).await {
        Ok(()) => {
            info!(factory_id = request.id.0, "factory deleted");
            Ok(Outcome::Committed)
        }
        Err(err) if err.is_not_found() => {
            Ok(Outcome::Ignored(Rejection::FactoryNotFound(request.id)))
        }
        Err(err) => Err(err),
    }
}

pub async fn regen_factory_nodes(
    ctx: &ApiContext,
    request: RegenFactoryNodesRequest,
) -> Result<Outcome, StorageError> {
    let max = ctx.config.max_children;
    if !(MIN_REGEN_CHILDREN..=max).contains(&request.num_children) {
        return Ok(Outcome::Ignored(Rejection::ChildCountOutOfRange {
            requested: request.num_children,
            min: MIN_REGEN_CHILDREN,
            max,
        }));
    }
    let count = usize::try_from(request.num_children).unwrap_or_default();

    match regenerate(&ctx.storage, request.id, Some(count)).await {
        Ok(nodes) => {
            info!(
                factory_id = request.id.0,
                nodes = nodes.len(),
                "factory nodes regenerated"
            );
            Ok(Outcome::Committed)
        }
        Err(err) if err.is_not_found() => {
            Ok(Outcome::Ignored(Rejection::FactoryNotFound(request.id)))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
