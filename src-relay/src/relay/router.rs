// Message router: one case per inbound message type
//
// Routing is a pure function of the authorities, the requesting connection,
// and the message. The server executes the returned outputs.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::authority::{Authorities, SessionParams, StartOutcome};
use super::peer::PeerIdentity;
use super::protocol::{RelayMessage, RelayRequest};

/// Where an output message goes
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Only the requesting connection
    Reply(RelayMessage),
    /// Every registered connection, the requester included
    Broadcast(RelayMessage),
}

/// What the router knows about the requesting connection
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub label: String,
    pub peer: Option<PeerIdentity>,
    /// Live connections at the time of the request
    pub connections: usize,
}

/// Snapshot of all sessions, optionally tagged with the category that changed
pub fn session_sync(
    authorities: &Authorities,
    category: Option<&str>,
    rejected: bool,
) -> RelayMessage {
    RelayMessage::SessionSync {
        sessions: authorities.sessions.snapshot(),
        category: category.map(str::to_string),
        rejected,
    }
}

pub fn schedule_sync(authorities: &Authorities) -> RelayMessage {
    RelayMessage::ScheduleSync {
        schedule: authorities.schedule.snapshot(),
    }
}

/// Dispatch one request
pub fn route(
    authorities: &Authorities,
    ctx: &RequestContext,
    request: RelayRequest,
) -> Vec<Outbound> {
    match request {
        RelayRequest::Ping => vec![
            Outbound::Reply(RelayMessage::Pong),
            Outbound::Reply(session_sync(authorities, None, false)),
            Outbound::Reply(schedule_sync(authorities)),
        ],

        RelayRequest::SessionStart {
            category,
            intent,
            categories,
            duration_minutes,
        } => {
            let params = SessionParams {
                intent,
                categories,
                duration_minutes,
            };
            match authorities.sessions.try_start(&category, params, Utc::now()) {
                StartOutcome::Accepted(session) => {
                    info!(
                        connection = %ctx.label,
                        category = %category,
                        duration_minutes = ?session.duration_minutes,
                        "session started"
                    );
                    vec![Outbound::Broadcast(session_sync(authorities, Some(&category), false))]
                }
                StartOutcome::AlreadyActive(existing) => {
                    debug!(
                        connection = %ctx.label,
                        category = %category,
                        started_at = %existing.started_at,
                        "session already active, correcting requester"
                    );
                    vec![Outbound::Reply(session_sync(authorities, Some(&category), true))]
                }
                StartOutcome::Full => {
                    warn!(
                        connection = %ctx.label,
                        category = %category,
                        "no room for another session category"
                    );
                    vec![Outbound::Reply(session_sync(authorities, Some(&category), true))]
                }
            }
        }

        RelayRequest::SessionEnd { category } => {
            match authorities.sessions.end(&category, Utc::now()) {
                Some(_) => info!(connection = %ctx.label, category = %category, "session ended"),
                None => debug!(connection = %ctx.label, category = %category, "nothing to end"),
            }
            vec![Outbound::Broadcast(session_sync(authorities, Some(&category), false))]
        }

        RelayRequest::SessionUpdate {
            category,
            intent,
            categories,
            duration_minutes,
        } => {
            let params = SessionParams {
                intent,
                categories,
                duration_minutes,
            };
            match authorities.sessions.update(&category, params) {
                Some(_) => {
                    debug!(connection = %ctx.label, category = %category, "session updated");
                    vec![Outbound::Broadcast(session_sync(authorities, Some(&category), false))]
                }
                None => {
                    debug!(
                        connection = %ctx.label,
                        category = %category,
                        "update for inactive session, correcting requester"
                    );
                    vec![Outbound::Reply(session_sync(authorities, Some(&category), true))]
                }
            }
        }

        RelayRequest::GetStatus => vec![Outbound::Reply(RelayMessage::Status {
            label: ctx.label.clone(),
            sessions: authorities.sessions.snapshot(),
            schedule: authorities.schedule.snapshot(),
            connections: ctx.connections,
            peer: ctx.peer.clone(),
        })],

        RelayRequest::GetUsage => vec![Outbound::Reply(RelayMessage::UsageResponse {
            usage: authorities.usage.report(&ctx.label),
        })],

        RelayRequest::UsageHeartbeat {
            domain,
            category,
            seconds,
        } => {
            let usage = authorities
                .usage
                .record(&ctx.label, &domain, category.as_deref(), seconds);
            vec![Outbound::Reply(RelayMessage::UsageResponse { usage })]
        }

        RelayRequest::Unrecognized => {
            debug!(connection = %ctx.label, "ignoring unrecognized message type");
            Vec::new()
        }
    }
}
