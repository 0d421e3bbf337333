//! Ordered application hooks.
//!
//! Every decoded message walks the chain in a fixed order: Auth gates
//! data behind login, Neighbor learns ARP bindings before anything
//! routing-dependent runs, Request serves the command plane, Online
//! keeps observability bookkeeping. `Drop` consumes the message and
//! short-circuits; an error aborts the session.

mod auth;
mod neighbor;
mod online;
mod request;

pub use auth::AuthHook;
pub use neighbor::NeighborHook;
pub use online::{OnlineEntry, OnlineHook, OnlineLog};
pub use request::RequestHook;

use std::sync::Arc;

use lanlink_proto::codec::FrameMessage;

use crate::error::Result;
use crate::server::SwitchCore;
use crate::session::PointSession;

/// Outcome of one hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    /// Pass the message to the next hook.
    Continue,
    /// Message consumed; no further hooks run.
    Drop,
}

/// One stage of the chain, dispatched by tag.
pub enum Hook {
    Auth(AuthHook),
    Neighbor(NeighborHook),
    Request(RequestHook),
    Online(OnlineHook),
}

impl Hook {
    pub async fn apply(
        &self,
        session: &Arc<PointSession>,
        msg: &FrameMessage,
    ) -> Result<HookFlow> {
        match self {
            Hook::Auth(h) => h.apply(session, msg).await,
            Hook::Neighbor(h) => h.apply(session, msg),
            Hook::Request(h) => h.apply(session, msg).await,
            Hook::Online(h) => h.apply(session, msg),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Hook::Auth(_) => "auth",
            Hook::Neighbor(_) => "neighbor",
            Hook::Request(_) => "request",
            Hook::Online(_) => "online",
        }
    }
}

/// The canonical chain. The order is load-bearing: auth must run
/// before anything else sees a data frame.
pub fn standard_chain(core: Arc<SwitchCore>) -> Vec<Hook> {
    vec![
        Hook::Auth(AuthHook::new(core.clone())),
        Hook::Neighbor(NeighborHook::new(core.clone())),
        Hook::Request(RequestHook::new(core.clone())),
        Hook::Online(OnlineHook::new(core)),
    ]
}

/// Walk the chain for one message.
pub async fn run_chain(
    hooks: &[Hook],
    session: &Arc<PointSession>,
    msg: &FrameMessage,
) -> Result<HookFlow> {
    for hook in hooks {
        match hook.apply(session, msg).await? {
            HookFlow::Continue => {}
            HookFlow::Drop => {
                tracing::trace!(session = %session.id(), hook = hook.name(), "message consumed");
                return Ok(HookFlow::Drop);
            }
        }
    }
    Ok(HookFlow::Continue)
}
