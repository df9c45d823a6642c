// SPDX-FileCopyrightText: AirVoice contributors
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Thin facade over the SIP stack.
//!
//! Owns the endpoint and its transport and exposes exactly the operations the
//! actor needs: digest-authenticated registration, accepting an INVITE into a
//! held transaction, early-media progress, and declining. Everything else the
//! stack does (parsing, transactions, retransmission timers) stays behind it.

use anyhow::{bail, Context, Result};
use bytesstr::BytesStr;
use sip_auth::digest::{DigestAuthenticator, DigestCredentials};
use sip_auth::{CredentialStore, RequestParts, UacAuthSession};
use sip_core::transport::udp::Udp;
use sip_core::transport::TargetTransportInfo;
use sip_core::{Endpoint, IncomingRequest, Layer, LayerKey, MayTake};
use sip_types::header::typed::{CallID, Contact};
use sip_types::uri::NameAddr;
use sip_types::{Code, Method, Name};
use sip_ua::dialog::{Dialog, DialogLayer};
use sip_ua::invite::acceptor::Acceptor;
use sip_ua::invite::InviteLayer;
use sip_ua::register::Registration;
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::settings::ModemConfig;

const USER_AGENT: &str = "AirVoice";

/// Traffic the event layer routes out of the endpoint's receive path.
pub enum StackEvent {
    Invite(IncomingRequest),
    /// CANCEL or BYE arrived for the call the actor marked as current.
    CallTerminated { method: Method },
}

/// Watches the raw receive path; takes INVITEs for the actor and reports
/// termination requests targeting the current call.
struct EventLayer {
    events: mpsc::UnboundedSender<StackEvent>,
    watched_call: Arc<parking_lot::Mutex<Option<CallID>>>,
}

#[async_trait::async_trait]
impl Layer for EventLayer {
    fn name(&self) -> &'static str {
        "airvoice"
    }

    async fn receive(&self, _endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        if request.line.method == Method::INVITE {
            let invite = request.take();
            if self.events.send(StackEvent::Invite(invite)).is_err() {
                log::warn!("SIP actor is gone, dropping INVITE");
            }
            return;
        }

        if request.line.method == Method::CANCEL || request.line.method == Method::BYE {
            let watched = self.watched_call.lock().clone();

            if watched.as_ref() == Some(&request.base_headers.call_id) {
                let _ = self.events.send(StackEvent::CallTerminated {
                    method: request.line.method.clone(),
                });
            }
        }
    }
}

/// An INVITE the stack handed over; held until the call terminates.
pub struct HeldInvite {
    pub call_id: CallID,
    acceptor: Acceptor,
}

pub struct Stack {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    dialog_layer: LayerKey<DialogLayer>,
    invite_layer: LayerKey<InviteLayer>,
    watched_call: Arc<parking_lot::Mutex<Option<CallID>>>,
}

/// Registration state for one account; refreshed from the actor's timer arm.
pub struct Registrar {
    registration: Registration,
    auth_sess: UacAuthSession,
    credentials: CredentialStore,
    target: TargetTransportInfo,
}

impl Registrar {
    pub async fn wait_for_expiry(&mut self) {
        self.registration.wait_for_expiry().await;
    }
}

impl Stack {
    /// Binds the SIP endpoint to UDP `0.0.0.0:<port>`.
    pub async fn bind(port: u16) -> Result<(Self, mpsc::UnboundedReceiver<StackEvent>)> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let watched_call = Arc::new(parking_lot::Mutex::new(None));

        let mut builder = Endpoint::builder();

        builder.add_layer(EventLayer {
            events,
            watched_call: watched_call.clone(),
        });
        let dialog_layer = builder.add_layer(DialogLayer::default());
        let invite_layer = builder.add_layer(InviteLayer::default());

        let transport = Udp::spawn(&mut builder, format!("0.0.0.0:{port}"))
            .await
            .context("failed to bind SIP UDP socket")?;
        let local_addr = transport.bound();

        let endpoint = builder.build();

        Ok((
            Self {
                endpoint,
                local_addr,
                dialog_layer,
                invite_layer,
                watched_call,
            },
            events_rx,
        ))
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Marks the call whose CANCEL/BYE traffic the event layer should report.
    pub fn watch_call(&self, call_id: Option<CallID>) {
        *self.watched_call.lock() = call_id;
    }

    /// Prepares digest-authenticated registration state from the modem's
    /// configuration. Also yields the Contact under which calls are accepted.
    pub async fn setup_registration(&self, config: &ModemConfig) -> Result<(Registrar, Contact)> {
        let id = self
            .endpoint
            .parse_uri(config.sip_id.as_str())
            .context("failed to parse sip_id as a URI")?;

        let registrar_uri = maybe_add_sip_scheme(&config.sip_host);
        let registrar_uri = self
            .endpoint
            .parse_uri(&*registrar_uri)
            .context("failed to parse sip_host as a URI")?;

        let (transport, target_addr) = self
            .endpoint
            .select_transport(&*registrar_uri)
            .await
            .with_context(|| format!("failed to select transport for '{}'", config.sip_host))?;

        let target = TargetTransportInfo {
            via_host_port: Some(
                SocketAddr::new(IpAddr::V4(config.local_ip), self.local_addr.port()).into(),
            ),
            transport: Some((transport, target_addr)),
        };

        let contact = Contact::new(NameAddr::uri(id.clone()));
        let registration = Registration::new(
            NameAddr::uri(id.clone()),
            NameAddr::uri(id),
            registrar_uri,
            std::time::Duration::from_secs(300),
        );

        let mut credentials = CredentialStore::new();
        credentials.set_default(DigestCredentials::new(
            config.username.clone(),
            config.password.clone(),
        ));

        Ok((
            Registrar {
                registration,
                auth_sess: UacAuthSession::new(DigestAuthenticator::default()),
                credentials,
                target,
            },
            contact,
        ))
    }

    /// Sends a REGISTER, answering authentication challenges along the way.
    pub async fn register(&self, registrar: &mut Registrar, remove_binding: bool) -> Result<()> {
        loop {
            let mut request = registrar.registration.create_register(remove_binding);
            request.headers.insert_named(self.endpoint.allowed());
            request.headers.insert(Name::USER_AGENT, USER_AGENT);

            registrar.auth_sess.authorize_request(&mut request.headers);

            let mut transaction = self
                .endpoint
                .send_request(request, &mut registrar.target)
                .await?;

            let response = transaction.receive_final().await?;

            let response_code = response.line.code;

            match response_code.into_u16() {
                200..=299 => {
                    if !remove_binding {
                        registrar.registration.receive_success_response(response);
                    }

                    return Ok(());
                }
                401 | 407 => registrar.auth_sess.handle_authenticate(
                    &response.headers,
                    &registrar.credentials,
                    RequestParts {
                        line: &transaction.request().msg.line,
                        headers: &transaction.request().msg.headers,
                        body: &transaction.request().msg.body,
                    },
                )?,
                400..=499 if !remove_binding => {
                    if !registrar.registration.receive_error_response(response) {
                        bail!("registration failed with code '{:?}'", response_code);
                    }
                }
                _ => bail!("registration failed with code '{:?}'", response_code),
            }
        }
    }

    /// Accepts an INVITE into a held server transaction.
    ///
    /// The stack already answers with 100 Trying here to quell retransmits
    /// while the cellular leg is being set up.
    pub async fn accept_invite(&self, contact: Contact, invite: IncomingRequest) -> Result<HeldInvite> {
        let call_id = invite.base_headers.call_id.clone();

        let dialog = Dialog::new_server(self.endpoint.clone(), self.dialog_layer, &invite, contact)?;
        let mut acceptor = Acceptor::new(dialog, self.invite_layer, invite)?;

        let response = acceptor.create_response(Code::TRYING, None).await?;
        acceptor.respond_provisional(response).await?;

        Ok(HeldInvite { call_id, acceptor })
    }

    /// Sends `183 Session Progress` carrying the SDP answer; this starts
    /// early media so the caller hears the cellular ringback.
    pub async fn send_session_progress(&self, invite: &mut HeldInvite, sdp: String) -> Result<()> {
        let mut response = invite
            .acceptor
            .create_response(Code::SESSION_PROGRESS, None)
            .await?;

        response.msg.body = sdp.into();
        response.msg.headers.insert(Name::CONTENT_TYPE, "application/sdp");
        response.msg.headers.insert(Name::USER_AGENT, USER_AGENT);

        invite.acceptor.respond_provisional(response).await?;

        Ok(())
    }

    /// Returns a held INVITE to the stack by finalizing it with 487.
    ///
    /// Covers CANCEL'd and locally abandoned calls alike; failures only mean
    /// the transaction is already finished.
    pub async fn decline(&self, mut invite: HeldInvite) {
        match invite
            .acceptor
            .create_response(Code::REQUEST_TERMINATED, None)
            .await
        {
            Ok(response) => {
                if let Err(e) = invite.acceptor.respond_failure(response).await {
                    log::debug!("failed to finalize INVITE transaction, {e:?}");
                }
            }
            Err(e) => log::debug!("failed to build 487 response, {e:?}"),
        }
    }
}

fn maybe_add_sip_scheme(i: &str) -> Cow<'_, str> {
    if i.starts_with("sip:") || i.starts_with("sips:") {
        Cow::Borrowed(i)
    } else {
        Cow::Owned(format!("sip:{i}"))
    }
}

/// Strips a destination number down to printable 7-bit ASCII.
pub fn normalize_number(raw: &str) -> Option<String> {
    let number: String = raw.chars().filter(char::is_ascii_graphic).collect();

    if number.is_empty() {
        None
    } else {
        Some(number)
    }
}

/// User part of the request's `From` URI, if it is a SIP URI with one.
pub fn from_user(request: &IncomingRequest) -> Option<BytesStr> {
    sip_uri_user(&*request.base_headers.from.uri.uri)
}

/// User part of the request URI; this is the number the caller dialed.
pub fn request_uri_user(request: &IncomingRequest) -> Option<BytesStr> {
    sip_uri_user(&*request.line.uri)
}

fn sip_uri_user(uri: &dyn sip_types::uri::Uri) -> Option<BytesStr> {
    use sip_types::uri::sip::{SipUri, UserPart};

    let uri = uri.downcast_ref::<SipUri>()?;

    match &uri.user_part {
        UserPart::User(user) => Some(user.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numbers_are_stripped_to_printable_ascii() {
        assert_eq!(normalize_number("15550123").as_deref(), Some("15550123"));
        assert_eq!(normalize_number("+1 555 0123").as_deref(), Some("+15550123"));
        assert_eq!(normalize_number("☎0123").as_deref(), Some("0123"));
        assert_eq!(normalize_number("☎☎☎"), None);
        assert_eq!(normalize_number(""), None);
        assert_eq!(normalize_number(" \t"), None);
    }

    #[test]
    fn sip_scheme_is_only_added_when_missing() {
        assert_eq!(maybe_add_sip_scheme("pbx.example.org"), "sip:pbx.example.org");
        assert_eq!(maybe_add_sip_scheme("sip:pbx.example.org"), "sip:pbx.example.org");
        assert_eq!(maybe_add_sip_scheme("sips:pbx.example.org"), "sips:pbx.example.org");
    }
}
