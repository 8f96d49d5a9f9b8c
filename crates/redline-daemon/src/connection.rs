use anyhow::{Result, anyhow};
use futures_util::SinkExt;
use libredline::{RedlineError, SessionManager, channel_callback};
use redline_protocol::{
    Command, EngagementState, ErrorCode, MAX_LINE_BYTES, Params, ProtocolError, Request, Response,
    ServerMessage,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;

/// State shared by every connection task.
pub struct Shared {
    pub manager: Arc<SessionManager>,
    pub config: DaemonConfig,
    pub shutdown_tx: watch::Sender<Option<String>>,
    pub started_at: std::time::Instant,
}

/// Client-side mistakes caught before the session manager is involved.
#[derive(Error, Debug)]
enum RequestError {
    #[error("missing required parameter '{0}'")]
    MissingParam(&'static str),

    #[error("parameter '{0}' must be {1}")]
    InvalidParam(&'static str, &'static str),

    #[error("not attached to engagement {0}")]
    NotAttached(String),
}

/// Subscriber id -> engagement id for the subscriptions this connection owns.
type Attachments = HashMap<String, String>;

pub fn enqueue(out_tx: &mpsc::Sender<ServerMessage>, message: impl Into<ServerMessage>) -> Result<()> {
    match out_tx.try_send(message.into()) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(anyhow!("client outbound queue full")),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow!("connection closed")),
    }
}

pub async fn handle_connection(
    stream: UnixStream,
    shared: Arc<Shared>,
    mut close_rx: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(shared.config.outbound_queue);
    let writer_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let line = match message.to_line() {
                Ok(line) => line,
                Err(err) => {
                    error!("failed to encode message: {err}");
                    continue;
                }
            };
            if let Err(err) = writer.send(line).await {
                warn!("socket write failed: {err}");
                break;
            }
        }
    });

    let mut attachments = Attachments::new();

    loop {
        let next = tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    debug!("transport closing, ending connection");
                    break;
                }
                continue;
            }
            next = futures_util::StreamExt::next(&mut reader) => next,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                // The framed reader cannot resume after a framing error.
                let response = match err {
                    LinesCodecError::MaxLineLengthExceeded => Response::error(
                        "",
                        ErrorCode::MalformedMessage,
                        format!("message exceeds {MAX_LINE_BYTES} bytes"),
                    ),
                    LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        Response::protocol_error(&ProtocolError::NotUtf8)
                    }
                    LinesCodecError::Io(e) => {
                        warn!("socket read failed: {e}");
                        break;
                    }
                };
                let _ = enqueue(&out_tx, response);
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match Request::decode(&line) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "rejected request at protocol boundary");
                if enqueue(&out_tx, Response::protocol_error(&err)).is_err() {
                    break;
                }
                continue;
            }
        };

        let id = request.id.clone();
        let command = request.command;
        let response = match dispatch(request, &shared, &out_tx, &mut attachments).await {
            Ok(data) => Response::ok(id, Some(data)),
            Err(err) => error_response(id, command, &err),
        };
        if enqueue(&out_tx, response).is_err() {
            break;
        }
    }

    for (subscriber_id, engagement_id) in attachments.drain() {
        shared.manager.unsubscribe(&engagement_id, &subscriber_id);
    }
    drop(out_tx);
    let _ = writer_task.await;
}

fn error_response(id: String, command: Command, err: &anyhow::Error) -> Response {
    if let Some(e) = err.downcast_ref::<RedlineError>() {
        let (code, message) = e.to_error_code();
        debug!(%command, ?code, "request failed: {message}");
        return Response::error_with_context(id, code, message, e.context());
    }
    if let Some(e) = err.downcast_ref::<RequestError>() {
        let code = match e {
            RequestError::NotAttached(_) => ErrorCode::NotAttached,
            _ => ErrorCode::InvalidParams,
        };
        return Response::error(id, code, e.to_string());
    }
    warn!(%command, "request failed: {err:#}");
    Response::error(id, ErrorCode::ServerError, format!("{err:#}"))
}

async fn dispatch(
    request: Request,
    shared: &Shared,
    out_tx: &mpsc::Sender<ServerMessage>,
    attachments: &mut Attachments,
) -> Result<Params> {
    let manager = &shared.manager;
    let params = &request.params;

    match request.command {
        Command::SessionsList => {
            let engagements = manager.list().await;
            Ok(object(json!({ "engagements": engagements })))
        }
        Command::EngagementStart => {
            let id = match optional_str(params, "engagement_id")? {
                Some(id) => id.to_string(),
                None => {
                    let config = required_str(params, "config")?;
                    let name = optional_str(params, "name")?;
                    manager.create(PathBuf::from(config), name).await?
                }
            };
            let state = manager.start(&id).await?;
            info!(engagement_id = %id, "engagement started by client");
            Ok(transitioned(&id, state))
        }
        Command::EngagementAttach => {
            let id = required_str(params, "engagement_id")?;
            let subscriber_id = manager.subscribe(id, channel_callback(out_tx.clone())).await?;
            attachments.insert(subscriber_id.clone(), id.to_string());
            let engagement = manager.get(id).await?;
            Ok(object(json!({
                "engagement_id": id,
                "subscriber_id": subscriber_id,
                "engagement": engagement,
            })))
        }
        Command::EngagementDetach => {
            let id = required_str(params, "engagement_id")?;
            let wanted = optional_str(params, "subscriber_id")?;
            let owned: Vec<String> = attachments
                .iter()
                .filter(|(sub, eid)| eid.as_str() == id && wanted.is_none_or(|w| w == sub.as_str()))
                .map(|(sub, _)| sub.clone())
                .collect();
            if owned.is_empty() {
                return Err(RequestError::NotAttached(id.to_string()).into());
            }
            for subscriber_id in &owned {
                attachments.remove(subscriber_id);
                manager.unsubscribe(id, subscriber_id);
            }
            Ok(object(json!({ "engagement_id": id, "detached": owned.len() })))
        }
        Command::EngagementPause => {
            let id = required_str(params, "engagement_id")?;
            Ok(transitioned(id, manager.pause(id).await?))
        }
        Command::EngagementResume => {
            let id = required_str(params, "engagement_id")?;
            Ok(transitioned(id, manager.resume(id).await?))
        }
        Command::EngagementStop => {
            let id = required_str(params, "engagement_id")?;
            Ok(transitioned(id, manager.stop(id).await?))
        }
        Command::EngagementComplete => {
            let id = required_str(params, "engagement_id")?;
            Ok(transitioned(id, manager.complete(id).await?))
        }
        Command::EngagementRemove => {
            let id = required_str(params, "engagement_id")?;
            let removed = manager.remove(id).await?;
            attachments.retain(|_, eid| eid.as_str() != id);
            Ok(object(json!({ "engagement_id": id, "removed": removed })))
        }
        Command::DaemonStatus => {
            let engagements = manager.list().await;
            let kill_switch = manager.kill_switch();
            Ok(object(json!({
                "pid": std::process::id(),
                "uptime_secs": shared.started_at.elapsed().as_secs(),
                "engagements": engagements.len(),
                "active": manager.active_count().await,
                "limits": manager.limits(),
                "frozen": kill_switch.is_frozen(),
                "halt_public_key": kill_switch.public_key_b64(),
                "shutting_down": manager.is_shutting_down(),
                "subscriptions": manager.subscriptions().total(),
                "last_kill": kill_switch.last_result(),
            })))
        }
        Command::DaemonStop => {
            let reason = optional_str(params, "reason")?
                .unwrap_or("client request")
                .to_string();
            info!(reason = %reason, "stop requested by client");
            shared.shutdown_tx.send_replace(Some(reason.clone()));
            Ok(object(json!({
                "stopping": true,
                "reason": reason,
                "shutdown_timeout_secs": manager.limits().shutdown_timeout.as_secs(),
            })))
        }
        Command::DaemonConfigReload => {
            let limits = shared.config.reload_limits()?;
            manager.apply_limits(limits).await;
            Ok(object(json!({ "limits": limits })))
        }
        Command::DaemonKill => {
            let reason = optional_str(params, "reason")?.unwrap_or("operator request");
            let actor = optional_str(params, "actor")?.unwrap_or("client");
            let result = manager.emergency_stop(reason, actor).await;
            Ok(object(to_value(&result)?))
        }
        Command::DaemonKillReset => {
            let actor = optional_str(params, "actor")?.unwrap_or("client");
            let was_frozen = manager.kill_switch().reset(actor);
            Ok(object(json!({ "was_frozen": was_frozen, "frozen": false })))
        }
    }
}

fn transitioned(id: &str, state: EngagementState) -> Params {
    object(json!({ "engagement_id": id, "state": state }))
}

fn required_str<'a>(params: &'a Params, key: &'static str) -> Result<&'a str> {
    optional_str(params, key)?.ok_or_else(|| RequestError::MissingParam(key).into())
}

fn optional_str<'a>(params: &'a Params, key: &'static str) -> Result<Option<&'a str>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.as_str())),
        Some(_) => Err(RequestError::InvalidParam(key, "a non-empty string").into()),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn object(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Params::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Params {
        object(value)
    }

    #[test]
    fn enqueue_fails_when_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        enqueue(&tx, Response::ok("a", None)).expect("first send should fit");
        let err = enqueue(&tx, Response::ok("b", None)).expect_err("second send should fail");
        assert!(err.to_string().contains("queue full"));
    }

    #[test]
    fn param_helpers_validate_types() {
        let p = params(json!({ "engagement_id": "e-1", "count": 3, "blank": "", "gone": null }));
        assert_eq!(required_str(&p, "engagement_id").unwrap(), "e-1");
        assert_eq!(optional_str(&p, "gone").unwrap(), None);
        assert_eq!(optional_str(&p, "absent").unwrap(), None);
        assert!(optional_str(&p, "count").is_err());
        assert!(optional_str(&p, "blank").is_err());

        let err = required_str(&p, "absent").unwrap_err();
        let response = error_response("r1".to_string(), Command::EngagementPause, &err);
        assert_eq!(response.code, Some(ErrorCode::InvalidParams));
        assert_eq!(response.id, "r1");
    }

    #[test]
    fn domain_errors_keep_their_code_and_context() {
        let err: anyhow::Error = RedlineError::CapacityExceeded { active: 2, max: 2 }.into();
        let response = error_response("r2".to_string(), Command::EngagementStart, &err);
        assert_eq!(response.code, Some(ErrorCode::CapacityExceeded));
        let data = response.data.expect("context");
        assert_eq!(data["max_engagements"], 2);

        let err: anyhow::Error = RequestError::NotAttached("e-1".to_string()).into();
        let response = error_response("r3".to_string(), Command::EngagementDetach, &err);
        assert_eq!(response.code, Some(ErrorCode::NotAttached));

        let err = anyhow!("disk on fire");
        let response = error_response("r4".to_string(), Command::DaemonConfigReload, &err);
        assert_eq!(response.code, Some(ErrorCode::ServerError));
    }

    #[test]
    fn object_wraps_scalars() {
        assert_eq!(object(json!(5))["value"], 5);
        assert_eq!(object(json!({ "a": 1 }))["a"], 1);
    }
}
