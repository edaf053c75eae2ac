//! Deliveries produced by the room registry and carried by the fan-out.

use retro_common::ServerEvent;
use serde::{Deserialize, Serialize};

/// Who inside a session should receive an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Target {
    /// Every connection bound to the session, optionally minus one.
    Room {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        except: Option<String>,
    },
    /// One connection, by its globally unique id.
    Connection { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub session_id: String,
    pub target: Target,
    pub event: ServerEvent,
}

impl Outbound {
    pub fn to_room(session_id: impl Into<String>, event: ServerEvent) -> Self {
        Self {
            session_id: session_id.into(),
            target: Target::Room { except: None },
            event,
        }
    }

    pub fn to_room_except(
        session_id: impl Into<String>,
        except: impl Into<String>,
        event: ServerEvent,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            target: Target::Room {
                except: Some(except.into()),
            },
            event,
        }
    }

    pub fn to_connection(
        session_id: impl Into<String>,
        connection_id: impl Into<String>,
        event: ServerEvent,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            target: Target::Connection {
                id: connection_id.into(),
            },
            event,
        }
    }

    /// Whether a connection currently bound to `bound_session` should
    /// forward this delivery.
    pub fn addressed_to(&self, connection_id: &str, bound_session: Option<&str>) -> bool {
        match &self.target {
            Target::Connection { id } => id == connection_id,
            Target::Room { except } => {
                bound_session == Some(self.session_id.as_str())
                    && except.as_deref() != Some(connection_id)
            }
        }
    }
}

/// An [`Outbound`] tagged with the instance that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: String,
    pub outbound: Outbound,
}
