//! Request/response command plane.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use lanlink_proto::codec::{Action, FrameMessage, Operator, RawControl};
use lanlink_proto::control::ErrorReply;

use crate::error::Result;
use crate::hooks::HookFlow;
use crate::server::SwitchCore;
use crate::session::PointSession;
use crate::tenant::Tenant;

pub struct RequestHook {
    core: Arc<SwitchCore>,
}

impl RequestHook {
    pub fn new(core: Arc<SwitchCore>) -> Self {
        Self { core }
    }

    pub async fn apply(
        &self,
        session: &Arc<PointSession>,
        msg: &FrameMessage,
    ) -> Result<HookFlow> {
        let Some(ctl) = msg.control() else {
            return Ok(HookFlow::Continue);
        };
        // Login is the auth hook's business.
        if ctl.action() == Some(Action::Login) {
            return Ok(HookFlow::Continue);
        }

        if ctl.operator() != Some(Operator::Request) {
            // Unsolicited responses and unknown operators get an error
            // back; the connection stays up.
            self.error_reply(session, &ctl, "operator mismatch")?;
            return Ok(HookFlow::Drop);
        }

        let Some(action) = ctl.action() else {
            warn!(
                session = %session.id(),
                action = %ctl.action_lossy(),
                "unknown control action"
            );
            self.error_reply(session, &ctl, "unknown action")?;
            return Ok(HookFlow::Drop);
        };

        match action {
            Action::Ping => {
                // Echo the body so endpoints can match request to reply.
                session.send_control(Action::Ping, Operator::Response, ctl.body);
            }
            Action::IpAddr => match self.session_tenant(session) {
                Some(tenant) => {
                    let reply = match session.address() {
                        Some(address) => serde_json::to_vec(&tenant.lease_reply(address))?,
                        None => serde_json::to_vec(&ErrorReply::new("no address leased"))?,
                    };
                    session.send_control(Action::IpAddr, Operator::Response, &reply);
                }
                None => self.error_reply(session, &ctl, "not authenticated")?,
            },
            Action::Neighbor => match self.session_tenant(session) {
                Some(tenant) => {
                    let reply = serde_json::to_vec(&tenant.neighbor_snapshot())?;
                    session.send_control(Action::Neighbor, Operator::Response, &reply);
                }
                None => self.error_reply(session, &ctl, "not authenticated")?,
            },
            Action::Stats => {
                let reply = serde_json::to_vec(&self.core.stats())?;
                session.send_control(Action::Stats, Operator::Response, &reply);
            }
            Action::Left | Action::Logout => {
                info!(session = %session.id(), action = %action, "endpoint leaving");
                let body = serde_json::to_vec(&json!({ "status": "leaving" }))?;
                session.send_control(action, Operator::Response, &body);
                // The reader loop observes the close and runs cleanup.
                session.close();
            }
            Action::Login => unreachable!("login handled above"),
        }
        debug!(session = %session.id(), action = %action, "request served");
        Ok(HookFlow::Drop)
    }

    fn session_tenant(&self, session: &Arc<PointSession>) -> Option<Arc<Tenant>> {
        if !session.is_authenticated() {
            return None;
        }
        session.tenant().and_then(|name| self.core.tenant(&name))
    }

    fn error_reply(
        &self,
        session: &Arc<PointSession>,
        ctl: &RawControl<'_>,
        reason: &str,
    ) -> Result<()> {
        let body = serde_json::to_vec(&ErrorReply::new(reason))?;
        session.send_control_raw(ctl.action, Operator::Response, &body);
        Ok(())
    }
}
