//! Login handling and the data gate.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use lanlink_proto::codec::{Action, FrameMessage, Operator};
use lanlink_proto::control::{ErrorReply, LoginRequest};

use crate::error::Result;
use crate::hooks::HookFlow;
use crate::server::SwitchCore;
use crate::session::{PointSession, SessionStatus};
use crate::tenant::Tenant;

pub struct AuthHook {
    core: Arc<SwitchCore>,
}

impl AuthHook {
    pub fn new(core: Arc<SwitchCore>) -> Self {
        Self { core }
    }

    pub async fn apply(
        &self,
        session: &Arc<PointSession>,
        msg: &FrameMessage,
    ) -> Result<HookFlow> {
        if let Some(ctl) = msg.control() {
            if ctl.action() == Some(Action::Login) && ctl.operator() == Some(Operator::Request) {
                return self.handle_login(session, ctl.body).await;
            }
            return Ok(HookFlow::Continue);
        }

        // Data from a session that has not authenticated goes nowhere.
        if !session.is_authenticated() {
            session.counters.add_dropped();
            return Ok(HookFlow::Drop);
        }
        Ok(HookFlow::Continue)
    }

    async fn handle_login(
        &self,
        session: &Arc<PointSession>,
        body: &[u8],
    ) -> Result<HookFlow> {
        session.advance(SessionStatus::Unauthenticated);

        let request: LoginRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                // Malformed JSON is a protocol error: answer, keep the
                // connection.
                warn!(session = %session.id(), error = %e, "malformed login body");
                let reply = serde_json::to_vec(&ErrorReply::new("malformed login body"))?;
                session.send_control(Action::Login, Operator::Response, &reply);
                return Ok(HookFlow::Drop);
            }
        };

        // `user@tenant` beats the body's network field.
        let (username, qualified_tenant) = match request.username.split_once('@') {
            Some((user, tenant)) => (user.to_string(), Some(tenant.to_string())),
            None => (request.username.clone(), None),
        };
        let tenant = match self.resolve_tenant(qualified_tenant.or(request.network.clone())) {
            Some(tenant) => tenant,
            None => {
                return self.reject(session, "no such network");
            }
        };

        if !tenant.authenticate(&username, &request.password) {
            warn!(
                session = %session.id(),
                user = %username,
                tenant = %tenant.name(),
                "login rejected"
            );
            return self.reject(session, "bad username or password");
        }

        let address = match tenant.attach(session).await {
            Ok(address) => address,
            Err(e) => {
                warn!(session = %session.id(), tenant = %tenant.name(), error = %e, "admit failed");
                return self.reject(session, &e.to_string());
            }
        };

        session.set_identity(&request.username, request.alias.clone());
        session.advance(SessionStatus::Authenticated);

        let reply = serde_json::to_vec(&tenant.lease_reply(address))?;
        session.send_control(Action::Login, Operator::Response, &reply);
        info!(
            session = %session.id(),
            user = %request.username,
            tenant = %tenant.name(),
            address = %address,
            "endpoint authenticated"
        );
        Ok(HookFlow::Drop)
    }

    fn resolve_tenant(&self, name: Option<String>) -> Option<Arc<Tenant>> {
        match name {
            Some(name) => self.core.tenant(&name),
            None => self.core.sole_tenant(),
        }
    }

    /// Failed login: answer with the reason, count the drop, close.
    fn reject(&self, session: &Arc<PointSession>, reason: &str) -> Result<HookFlow> {
        let reply = serde_json::to_vec(&json!({ "error": reason }))?;
        session.send_control(Action::Login, Operator::Response, &reply);
        session.counters.add_dropped();
        session.close();
        Ok(HookFlow::Drop)
    }
}
