use super::dispatcher::{Dispatcher, RawSignal};
use super::{Registrar, SignalingEvent, SignalingTransport};
use crate::config::{AgentIdentity, SipConfig};
use crate::error::TransportError;
use crate::event::EventQueue;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rsip::prelude::HeadersExt;
use rsip::StatusCodeKind;
use rsipstack::dialog::authenticate::Credential;
use rsipstack::dialog::dialog::{
    Dialog, DialogState, DialogStateReceiver, DialogStateSender, TerminatedReason,
};
use rsipstack::dialog::dialog_layer::DialogLayer;
use rsipstack::dialog::invitation::InviteOption;
use rsipstack::dialog::registration::Registration;
use rsipstack::dialog::server_dialog::ServerInviteDialog;
use rsipstack::dialog::DialogId;
use rsipstack::transaction::{Endpoint, TransactionReceiver};
use rsipstack::transport::{udp::UdpConnection, TransportLayer};
use rsipstack::EndpointBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct SipUserAgentBuilder {
    config: Option<SipConfig>,
    identity: Option<AgentIdentity>,
    cancel_token: Option<CancellationToken>,
    queue: Option<EventQueue>,
}

enum CallLeg {
    Outbound {
        token: CancellationToken,
        dialog_id: Option<DialogId>,
    },
    Inbound {
        dialog: ServerInviteDialog,
        dialog_id: DialogId,
    },
}

/// The agent's SIP endpoint: registration, one outbound or inbound leg per
/// engine call id.
pub struct SipUserAgent {
    identity: AgentIdentity,
    config: SipConfig,
    token: CancellationToken,
    endpoint: Endpoint,
    dialog_layer: Arc<DialogLayer>,
    contact: rsip::Uri,
    dispatcher: Dispatcher,
    legs: Arc<Mutex<HashMap<String, CallLeg>>>,
    inbound_calls: Mutex<HashMap<DialogId, String>>,
}

impl Default for SipUserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SipUserAgentBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            identity: None,
            cancel_token: None,
            queue: None,
        }
    }

    pub fn with_config(mut self, config: SipConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_identity(mut self, identity: AgentIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_event_queue(mut self, queue: EventQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub async fn build(mut self) -> Result<SipUserAgent> {
        let identity = self
            .identity
            .take()
            .ok_or_else(|| anyhow!("agent identity is required"))?;
        let queue = self
            .queue
            .take()
            .ok_or_else(|| anyhow!("engine event queue is required"))?;
        let token = self.cancel_token.take().unwrap_or_default();
        let config = self.config.take().unwrap_or_default();

        let local_addr = config.local_addr()?;
        let transport_layer = TransportLayer::new(token.clone());
        let udp_conn = UdpConnection::create_connection(local_addr, None)
            .await
            .map_err(|e| anyhow!("Failed to create UDP connection: {}", e))?;
        let contact_addr = udp_conn.get_addr().addr.clone();
        transport_layer.add_transport(udp_conn.into());

        let mut endpoint_builder = EndpointBuilder::new();
        endpoint_builder
            .with_cancel_token(token.child_token())
            .with_transport_layer(transport_layer);
        if let Some(ref useragent) = config.useragent {
            endpoint_builder.with_user_agent(useragent.as_str());
        }
        let endpoint = endpoint_builder.build();
        let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));

        let contact = rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            auth: Some(rsip::Auth {
                user: identity.extension.clone(),
                password: None,
            }),
            host_with_port: contact_addr,
            params: vec![],
            headers: vec![],
        };
        info!(contact = %contact, "sip user agent bound");

        Ok(SipUserAgent {
            identity,
            config,
            token,
            endpoint,
            dialog_layer,
            contact,
            dispatcher: Dispatcher::new(queue),
            legs: Arc::new(Mutex::new(HashMap::new())),
            inbound_calls: Mutex::new(HashMap::new()),
        })
    }
}

fn terminated_signal(reason: &TerminatedReason) -> RawSignal {
    let name = match reason {
        TerminatedReason::UacCancel => "cancelled",
        TerminatedReason::UacBusy | TerminatedReason::UasBusy => "busy",
        TerminatedReason::UasDecline => "declined",
        TerminatedReason::UacOther(Some(code)) | TerminatedReason::UasOther(Some(code)) => {
            return RawSignal::Code {
                code: code.code(),
                reason: Some(code.to_string()),
                body: None,
            };
        }
        TerminatedReason::UacOther(None) | TerminatedReason::UasOther(None) => "failed",
        _ => "terminated",
    };
    RawSignal::Named {
        name: name.to_string(),
        reason: None,
        body: None,
    }
}

/// The invite task and the dialog-state loop both see a failed outbound
/// invite; only the one that removes the leg reports it.
async fn end_outbound_leg(
    legs: &Mutex<HashMap<String, CallLeg>>,
    dispatcher: &Dispatcher,
    call_id: &str,
    signal: RawSignal,
) {
    if legs.lock().await.remove(call_id).is_some() {
        dispatcher.dispatch(call_id, signal);
    } else {
        debug!(call_id, "outbound leg already ended");
    }
}

fn state_dialog_id(state: &DialogState) -> &DialogId {
    match state {
        DialogState::Calling(id, ..) => id,
        DialogState::Trying(id, ..) => id,
        DialogState::Early(id, ..) => id,
        DialogState::WaitAck(id, ..) => id,
        DialogState::Confirmed(id, ..) => id,
        DialogState::Updated(id, ..) => id,
        DialogState::Notify(id, ..) => id,
        DialogState::Info(id, ..) => id,
        DialogState::Options(id, ..) => id,
        DialogState::Terminated(id, ..) => id,
    }
}

impl SipUserAgent {
    fn credential(&self) -> Credential {
        Credential {
            username: self.identity.extension.clone(),
            password: self.identity.credential.clone(),
            realm: Some(self.identity.signaling_domain.clone()),
        }
    }

    fn server_uri(&self) -> Result<rsip::Uri, TransportError> {
        rsip::Uri::try_from(self.identity.server_uri())
            .map_err(|e| TransportError::Request(format!("invalid server uri: {}", e)))
    }

    pub fn config(&self) -> &SipConfig {
        &self.config
    }

    async fn process_incoming_request(
        &self,
        mut incoming: TransactionReceiver,
        state_sender: DialogStateSender,
    ) -> Result<()> {
        while let Some(mut tx) = incoming.recv().await {
            debug!("received transaction: {:?}", tx.key);
            if tx.original.to_header()?.tag()?.is_some() {
                match self.dialog_layer.match_dialog(&tx.original) {
                    Some(mut d) => {
                        tokio::spawn(async move {
                            if let Err(e) = d.handle(tx).await {
                                info!("error handling transaction: {:?}", e);
                            }
                        });
                    }
                    None => {
                        info!("dialog not found: {}", tx.original);
                        if let Err(e) = tx
                            .reply(rsip::StatusCode::CallTransactionDoesNotExist)
                            .await
                        {
                            info!("error replying to request: {:?}", e);
                        }
                    }
                }
                continue;
            }
            // out of dialog
            match tx.original.method {
                rsip::Method::Invite | rsip::Method::Ack => {
                    let mut dialog = match self.dialog_layer.get_or_create_server_invite(
                        &tx,
                        state_sender.clone(),
                        None,
                        Some(self.contact.clone()),
                    ) {
                        Ok(d) => d,
                        Err(e) => {
                            info!("failed to obtain dialog: {:?}", e);
                            if let Err(e) = tx
                                .reply(rsip::StatusCode::CallTransactionDoesNotExist)
                                .await
                            {
                                info!("error replying to request: {:?}", e);
                            }
                            continue;
                        }
                    };
                    tokio::spawn(async move {
                        if let Err(e) = dialog.handle(tx).await {
                            info!("error handling invite transaction: {:?}", e);
                        }
                    });
                }
                rsip::Method::Options => {
                    if let Err(e) = tx.reply(rsip::StatusCode::OK).await {
                        info!("error replying to options: {:?}", e);
                    }
                }
                _ => {
                    info!("unsupported request: {:?}", tx.original.method);
                    if let Err(e) = tx.reply(rsip::StatusCode::MethodNotAllowed).await {
                        info!("error replying to request: {:?}", e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_incoming_invite(&self, dialog: ServerInviteDialog, dialog_id: DialogId) {
        if self.inbound_calls.lock().await.contains_key(&dialog_id) {
            return;
        }
        let request = dialog.initial_request();
        let peer_number = request
            .from_header()
            .ok()
            .and_then(|from| from.uri().ok())
            .and_then(|uri| uri.user().map(|u| u.to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        let offer = if request.body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&request.body).to_string())
        };

        let call_id = uuid::Uuid::new_v4().to_string();
        info!(call_id, %dialog_id, peer_number, "incoming invite");
        self.inbound_calls
            .lock()
            .await
            .insert(dialog_id.clone(), call_id.clone());
        self.legs
            .lock()
            .await
            .insert(call_id.clone(), CallLeg::Inbound { dialog, dialog_id });
        self.dispatcher.post(SignalingEvent::IncomingInvite {
            call_id,
            peer_number,
            offer,
        });
    }

    async fn process_server_dialog(&self, mut state_receiver: DialogStateReceiver) -> Result<()> {
        while let Some(state) = state_receiver.recv().await {
            let id = state_dialog_id(&state).clone();
            match state {
                DialogState::Calling(..) => {
                    let dialog = match self.dialog_layer.get_dialog(&id) {
                        Some(Dialog::ServerInvite(d)) => d,
                        _ => continue,
                    };
                    self.on_incoming_invite(dialog, id).await;
                }
                DialogState::Confirmed(..) => {
                    info!(%id, "server dialog confirmed");
                }
                DialogState::Terminated(_, reason) => {
                    info!(%id, ?reason, "server dialog terminated");
                    self.dialog_layer.remove_dialog(&id);
                    let call_id = self.inbound_calls.lock().await.remove(&id);
                    if let Some(call_id) = call_id {
                        self.legs.lock().await.remove(&call_id);
                        let signal = match reason {
                            TerminatedReason::UacCancel => RawSignal::Named {
                                name: "cancelled".to_string(),
                                reason: None,
                                body: None,
                            },
                            _ => RawSignal::Named {
                                name: "terminated".to_string(),
                                reason: None,
                                body: None,
                            },
                        };
                        self.dispatcher.dispatch(&call_id, signal);
                    }
                }
                other => {
                    debug!("received dialog state: {}", other);
                }
            }
        }
        Ok(())
    }

    /// Runs the endpoint and the request/dialog loops until cancelled.
    pub async fn serve(&self) -> Result<()> {
        let incoming_txs = self.endpoint.incoming_transactions();
        let endpoint_inner = self.endpoint.inner.clone();
        let (state_sender, state_receiver) = unbounded_channel();

        tokio::select! {
            _ = self.token.cancelled() => {
                info!("user agent cancelled");
            }
            result = endpoint_inner.serve() => {
                if let Err(e) = result {
                    warn!("endpoint serve error: {:?}", e);
                }
            }
            result = self.process_incoming_request(incoming_txs, state_sender) => {
                if let Err(e) = result {
                    warn!("process incoming request error: {:?}", e);
                }
            }
            result = self.process_server_dialog(state_receiver) => {
                if let Err(e) = result {
                    warn!("process dialog error: {:?}", e);
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        info!("stopping user agent");
        self.token.cancel();
    }
}

async fn client_dialog_event_loop(
    call_id: String,
    dispatcher: Dispatcher,
    legs: Arc<Mutex<HashMap<String, CallLeg>>>,
    dialog_layer: Arc<DialogLayer>,
    mut state_receiver: DialogStateReceiver,
) {
    while let Some(state) = state_receiver.recv().await {
        let id = state_dialog_id(&state).clone();
        if let Some(CallLeg::Outbound { dialog_id, .. }) = legs.lock().await.get_mut(&call_id) {
            dialog_id.get_or_insert_with(|| id.clone());
        }
        match state {
            DialogState::Early(_, resp) => {
                let code = resp.status_code.code();
                info!(call_id, %id, code, "client dialog early");
                dispatcher.dispatch(
                    &call_id,
                    RawSignal::Code {
                        code,
                        reason: None,
                        body: None,
                    },
                );
            }
            DialogState::Confirmed(..) => {
                info!(call_id, %id, "client dialog confirmed");
            }
            DialogState::Terminated(_, reason) => {
                info!(call_id, %id, ?reason, "client dialog terminated");
                dialog_layer.remove_dialog(&id);
                end_outbound_leg(&legs, &dispatcher, &call_id, terminated_signal(&reason)).await;
                break;
            }
            other => debug!(call_id, "client dialog state: {}", other),
        }
    }
}

#[async_trait]
impl SignalingTransport for SipUserAgent {
    async fn send_invite(
        &self,
        call_id: &str,
        target: &str,
        offer: String,
    ) -> Result<(), TransportError> {
        let caller = rsip::Uri::try_from(self.identity.uri())
            .map_err(|e| TransportError::Request(format!("invalid caller: {}", e)))?;
        let callee = rsip::Uri::try_from(self.identity.target_uri(target))
            .map_err(|e| TransportError::Request(format!("invalid target: {}", e)))?;
        let invite_option = InviteOption {
            caller,
            callee,
            content_type: Some("application/sdp".to_string()),
            offer: Some(offer.into_bytes()),
            contact: self.contact.clone(),
            credential: Some(self.credential()),
            ..Default::default()
        };
        info!(call_id, "invite {} -> {}", invite_option.caller, invite_option.callee);

        let token = self.token.child_token();
        self.legs.lock().await.insert(
            call_id.to_string(),
            CallLeg::Outbound {
                token: token.clone(),
                dialog_id: None,
            },
        );

        let (state_sender, state_receiver) = unbounded_channel();
        tokio::spawn(client_dialog_event_loop(
            call_id.to_string(),
            self.dispatcher.clone(),
            self.legs.clone(),
            self.dialog_layer.clone(),
            state_receiver,
        ));

        let dialog_layer = self.dialog_layer.clone();
        let dispatcher = self.dispatcher.clone();
        let legs = self.legs.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => {
                    info!(call_id, "invite cancelled locally");
                    return;
                }
                r = dialog_layer.do_invite(invite_option, state_sender) => r,
            };
            match result {
                Ok((dialog, resp)) => {
                    if let Some(CallLeg::Outbound { dialog_id, .. }) =
                        legs.lock().await.get_mut(&call_id)
                    {
                        *dialog_id = Some(dialog.id());
                    }
                    match resp {
                        Some(resp) => {
                            let code = resp.status_code.code();
                            let body = (resp.status_code.kind() == StatusCodeKind::Successful)
                                .then(|| String::from_utf8_lossy(&resp.body).to_string());
                            let signal = RawSignal::Code {
                                code,
                                reason: Some(resp.status_code.to_string()),
                                body,
                            };
                            if code >= 300 {
                                end_outbound_leg(&legs, &dispatcher, &call_id, signal).await;
                            } else {
                                dispatcher.dispatch(&call_id, signal);
                            }
                        }
                        None => dispatcher.post(SignalingEvent::Failed {
                            call_id,
                            reason: "no response to invite".to_string(),
                        }),
                    }
                }
                Err(e) => {
                    warn!(call_id, "invite failed: {}", e);
                    let signal = RawSignal::Named {
                        name: "failed".to_string(),
                        reason: Some(e.to_string()),
                        body: None,
                    };
                    end_outbound_leg(&legs, &dispatcher, &call_id, signal).await;
                }
            }
        });
        Ok(())
    }

    async fn send_response(
        &self,
        call_id: &str,
        code: u16,
        answer: Option<String>,
    ) -> Result<(), TransportError> {
        let legs = self.legs.lock().await;
        let dialog = match legs.get(call_id) {
            Some(CallLeg::Inbound { dialog, .. }) => dialog.clone(),
            _ => return Err(TransportError::UnknownCall(call_id.to_string())),
        };
        drop(legs);
        info!(call_id, code, "responding to invite");
        let result = match code {
            180 | 183 => dialog.ringing(None, None),
            200..=299 => {
                let headers = vec![rsip::Header::ContentType(
                    "application/sdp".to_string().into(),
                )];
                dialog.accept(Some(headers), answer.map(|a| a.into_bytes()))
            }
            _ => {
                let result = dialog.reject(Some(rsip::StatusCode::from(code)), None);
                if let Some(CallLeg::Inbound { dialog_id, .. }) =
                    self.legs.lock().await.remove(call_id)
                {
                    self.inbound_calls.lock().await.remove(&dialog_id);
                }
                result
            }
        };
        result.map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn cancel(&self, call_id: &str) -> Result<(), TransportError> {
        let leg = self.legs.lock().await.remove(call_id);
        match leg {
            Some(CallLeg::Outbound { token, dialog_id }) => {
                token.cancel();
                if let Some(id) = dialog_id {
                    if let Some(dialog) = self.dialog_layer.get_dialog(&id) {
                        dialog.hangup().await.ok();
                    }
                    self.dialog_layer.remove_dialog(&id);
                }
                info!(call_id, "outbound invite cancelled");
                Ok(())
            }
            Some(CallLeg::Inbound { dialog, dialog_id }) => {
                dialog.reject(Some(rsip::StatusCode::RequestTerminated), None).ok();
                self.inbound_calls.lock().await.remove(&dialog_id);
                Ok(())
            }
            None => Err(TransportError::UnknownCall(call_id.to_string())),
        }
    }

    async fn send_termination(&self, call_id: &str) -> Result<(), TransportError> {
        let dialog_id = match self.legs.lock().await.remove(call_id) {
            Some(CallLeg::Outbound { token, dialog_id }) => {
                token.cancel();
                dialog_id
            }
            Some(CallLeg::Inbound { dialog_id, .. }) => {
                self.inbound_calls.lock().await.remove(&dialog_id);
                Some(dialog_id)
            }
            None => None,
        };
        let id = dialog_id.ok_or_else(|| TransportError::UnknownCall(call_id.to_string()))?;
        match self.dialog_layer.get_dialog(&id) {
            Some(dialog) => {
                dialog
                    .hangup()
                    .await
                    .map_err(|e| TransportError::Request(e.to_string()))?;
                self.dialog_layer.remove_dialog(&id);
                info!(call_id, %id, "call terminated");
                Ok(())
            }
            None => Err(TransportError::UnknownCall(call_id.to_string())),
        }
    }
}

#[async_trait]
impl Registrar for SipUserAgent {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.token.is_cancelled() {
            return Err(TransportError::Unreachable("user agent stopped".to_string()));
        }
        let server = self.server_uri()?;
        debug!(server = %server, "signaling transport ready");
        Ok(())
    }

    async fn register(&self, expires: u32) -> Result<u32, TransportError> {
        let server = self.server_uri()?;
        let mut registration =
            Registration::new(self.endpoint.inner.clone(), Some(self.credential()));
        let resp = registration
            .register(server, Some(expires))
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        debug!(user = self.identity.aor(), "registration response: {}", resp.status_code);
        match resp.status_code.kind() {
            StatusCodeKind::Successful if expires == 0 => Ok(0),
            StatusCodeKind::Successful => Ok(registration.expires()),
            _ => Err(TransportError::Rejected {
                status: resp.status_code.code(),
                reason: Some(resp.status_code.to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EngineEvent;
    use crate::useragent::dispatcher::normalize;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn outbound_legs(call_id: &str) -> Mutex<HashMap<String, CallLeg>> {
        let mut legs = HashMap::new();
        legs.insert(
            call_id.to_string(),
            CallLeg::Outbound {
                token: CancellationToken::new(),
                dialog_id: None,
            },
        );
        Mutex::new(legs)
    }

    fn drain(rx: &mut UnboundedReceiver<EngineEvent>) -> Vec<SignalingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Signaling(event) = event {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_terminated_signal_keeps_status() {
        let reason = TerminatedReason::UasOther(Some(rsip::StatusCode::NotFound));
        assert!(matches!(
            terminated_signal(&reason),
            RawSignal::Code { code: 404, .. }
        ));
        let reason = TerminatedReason::UasOther(Some(rsip::StatusCode::TemporarilyUnavailable));
        assert!(matches!(
            normalize("c", terminated_signal(&reason)),
            Some(SignalingEvent::Rejected { code: 480, .. })
        ));
        assert!(matches!(
            normalize("c", terminated_signal(&TerminatedReason::UasOther(None))),
            Some(SignalingEvent::Failed { .. })
        ));
        assert!(matches!(
            normalize("c", terminated_signal(&TerminatedReason::UasBusy)),
            Some(SignalingEvent::Rejected { code: 486, .. })
        ));
        assert_eq!(
            normalize("c", terminated_signal(&TerminatedReason::UasBye)),
            Some(SignalingEvent::Terminated { call_id: "c".into() })
        );
    }

    #[tokio::test]
    async fn test_failed_invite_reported_once() {
        let not_found = || RawSignal::Code {
            code: 404,
            reason: Some("Not Found".to_string()),
            body: None,
        };
        let dialog_ended =
            || terminated_signal(&TerminatedReason::UasOther(Some(rsip::StatusCode::NotFound)));

        // dialog-state loop first, then the invite task
        let (tx, mut rx) = unbounded_channel();
        let dispatcher = Dispatcher::new(tx);
        let legs = outbound_legs("call-1");
        end_outbound_leg(&legs, &dispatcher, "call-1", dialog_ended()).await;
        end_outbound_leg(&legs, &dispatcher, "call-1", not_found()).await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            SignalingEvent::Rejected { code: 404, .. }
        ));

        // invite task first
        let legs = outbound_legs("call-2");
        end_outbound_leg(&legs, &dispatcher, "call-2", not_found()).await;
        end_outbound_leg(&legs, &dispatcher, "call-2", dialog_ended()).await;
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![SignalingEvent::Rejected {
                call_id: "call-2".into(),
                code: 404,
                reason: Some("Not Found".into()),
            }]
        );
        assert!(legs.lock().await.is_empty());
    }
}
