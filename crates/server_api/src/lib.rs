use std::time::Duration;

use shared::{
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use storage::{Storage, StorageError};
use thiserror::Error;
use tracing::{debug, error, warn};

pub mod broadcaster;
pub mod coordinator;
pub mod random;
pub mod regenerate;
pub mod sessions;
pub mod validation;

use broadcaster::SnapshotBroadcaster;
use coordinator::Outcome;
use sessions::{SessionId, SessionRegistry};

pub const DEFAULT_MAX_CHILDREN: i64 = 15;
pub const DEFAULT_PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Largest magnitude a factory bound may have.
    pub max_bound: i64,
    /// Largest child count a regeneration request may ask for.
    pub max_children: i64,
    /// Largest child count an addFactory request may ask for.
    pub max_initial_children: i64,
    /// Budget for one operation's persistence work up to its commit. The
    /// broadcast that follows a commit is not cut short by it.
    pub persistence_timeout: Duration,
    /// Tell the sender about requests dropped for a stale id or an
    /// out-of-range regeneration count.
    pub notify_rejections: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_bound: validation::DEFAULT_MAX_BOUND,
            max_children: DEFAULT_MAX_CHILDREN,
            max_initial_children: validation::DEFAULT_MAX_INITIAL_CHILDREN,
            persistence_timeout: DEFAULT_PERSISTENCE_TIMEOUT,
            notify_rejections: false,
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub sessions: SessionRegistry,
    pub broadcaster: SnapshotBroadcaster,
    pub config: EngineConfig,
}

impl ApiContext {
    pub fn new(storage: Storage, config: EngineConfig) -> Self {
        let sessions = SessionRegistry::new();
        let broadcaster = SnapshotBroadcaster::new(storage.clone(), sessions.clone());
        Self {
            storage,
            sessions,
            broadcaster,
            config,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("persistence failed: {0}")]
    Persistence(#[from] StorageError),
    #[error("persistence timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode server event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sends the current tree to a newly connected session only.
pub async fn on_connect(ctx: &ApiContext, session: SessionId) -> Result<(), DispatchError> {
    let result = tokio::time::timeout(
        ctx.config.persistence_timeout,
        ctx.broadcaster.emit_to_one(session),
    )
    .await
    .map_err(|_| DispatchError::Timeout(ctx.config.persistence_timeout))
    .and_then(|delivered| delivered);

    if let Err(err) = &result {
        error!(%session, error = %err, "failed to send initial tree");
        notify_failure(ctx, session, err).await;
    }
    result.map(|_| ())
}

/// Entry point for one inbound text frame. Frames that do not parse as a
/// [`ClientRequest`] are answered with a `malformed_request` error and never
/// reach validation.
pub async fn handle_frame(ctx: &ApiContext, session: SessionId, text: &str) {
    match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => handle_request(ctx, session, request).await,
        Err(err) => {
            warn!(%session, error = %err, "malformed client request");
            let event = ServerEvent::Error(ApiError::new(
                ErrorCode::MalformedRequest,
                format!("malformed request: {err}"),
            ));
            send_or_log(ctx, session, &event).await;
        }
    }
}

/// Runs one request and reports failures to the sender. Other sessions are
/// unaffected by a failed operation.
pub async fn handle_request(ctx: &ApiContext, session: SessionId, request: ClientRequest) {
    let kind = request.kind();
    if let Err(err) = dispatch(ctx, session, request).await {
        error!(%session, kind, error = %err, "request failed");
        notify_failure(ctx, session, &err).await;
    }
}

/// Applies a request and delivers its notification: the new tree to every
/// session after a commit, or a validation message to the sender.
///
/// Only the mutation runs under `persistence_timeout`. A timed-out mutation
/// rolls back; once one has committed, the broadcast always runs.
pub async fn dispatch(
    ctx: &ApiContext,
    session: SessionId,
    request: ClientRequest,
) -> Result<Outcome, DispatchError> {
    let kind = request.kind();
    debug!(%session, kind, "applying request");

    let budget = ctx.config.persistence_timeout;
    let outcome = tokio::time::timeout(budget, apply(ctx, request))
        .await
        .map_err(|_| DispatchError::Timeout(budget))??;

    notify(ctx, session, kind, &outcome).await?;
    Ok(outcome)
}

async fn apply(ctx: &ApiContext, request: ClientRequest) -> Result<Outcome, StorageError> {
    match request {
        ClientRequest::AddFactory(req) => coordinator::add_factory(ctx, req).await,
        ClientRequest::EditFactory(req) => coordinator::edit_factory(ctx, req).await,
        ClientRequest::DeleteFactory(req) => coordinator::delete_factory(ctx, req).await,
        ClientRequest::RegenFactoryNodes(req) => coordinator::regen_factory_nodes(ctx, req).await,
    }
}

async fn notify(
    ctx: &ApiContext,
    session: SessionId,
    kind: &'static str,
    outcome: &Outcome,
) -> Result<(), DispatchError> {
    match outcome {
        Outcome::Committed => {
            ctx.broadcaster.emit_to_all().await?;
        }
        Outcome::Invalid(message) => {
            debug!(%session, kind, %message, "request failed validation");
            ctx.sessions
                .send_event(session, &ServerEvent::ValidationError(message.clone()))
                .await?;
        }
        Outcome::Ignored(rejection) => {
            debug!(%session, kind, ?rejection, "request ignored");
            if ctx.config.notify_rejections {
                ctx.sessions
                    .send_event(session, &ServerEvent::Error(rejection.to_api_error()))
                    .await?;
            }
        }
    }
    Ok(())
}

async fn notify_failure(ctx: &ApiContext, session: SessionId, err: &DispatchError) {
    let event = ServerEvent::Error(ApiError::new(ErrorCode::Internal, err.to_string()));
    send_or_log(ctx, session, &event).await;
}

async fn send_or_log(ctx: &ApiContext, session: SessionId, event: &ServerEvent) {
    match ctx.sessions.send_event(session, event).await {
        Ok(true) => {}
        Ok(false) => debug!(%session, "session closed before reply"),
        Err(err) => error!(%session, error = %err, "failed to encode reply"),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
