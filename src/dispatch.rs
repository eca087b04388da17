//! Routes decoded stanzas to the correlator or to exactly one callback.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::callbacks::SessionCallbacks;
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::events::{
    FromStanza, IncomingMessage, MessageError, Pong, Receipt, ReceiptKind, RosterPush,
    TypingEvent,
};
use crate::session::Notification;
use crate::stanza::{Stanza, StanzaKind};

const ROSTER_NAMESPACE: &str = "jabber:iq:roster";

pub struct Dispatcher {
    callbacks: Arc<dyn SessionCallbacks>,
    last_ping: Option<Instant>,
}

impl Dispatcher {
    pub fn new(callbacks: Arc<dyn SessionCallbacks>) -> Self {
        Self {
            callbacks,
            last_ping: None,
        }
    }

    /// Record a ping write so the next pong carries a latency.
    pub fn ping_sent(&mut self, at: Instant) {
        self.last_ping = Some(at);
    }

    /// Deliver a state machine notification.
    pub fn notify(&self, notification: &Notification) {
        let cb = &self.callbacks;
        match notification {
            Notification::Authenticated => cb.on_authenticated(),
            Notification::LoginEnded(success) => cb.on_login_ended(success),
            Notification::LoginError(failure) => cb.on_login_error(failure),
            Notification::ConnectionFailed(failure) => cb.on_connection_failed(failure),
            Notification::CaptchaReceived(captcha) => cb.on_captcha_received(captcha),
            Notification::TempBanReceived(ban) => cb.on_temp_ban_received(ban),
            Notification::Disconnected(reason) => cb.on_disconnected(reason),
        }
    }

    /// Resolve a pending request or route an unsolicited stanza.
    pub fn dispatch(&mut self, stanza: Stanza, correlator: &mut Correlator, now: Instant) {
        if let Some(id) = stanza.id().map(str::to_owned) {
            if correlator.is_pending(&id) {
                // The requester is woken before the observer callback runs.
                let observed = stanza.clone();
                correlator.resolve(&id, stanza);
                self.callbacks.on_iq_response(&observed);
                return;
            }
        }

        if let Err(e) = self.route(&stanza, now) {
            match e {
                Error::MalformedResponse(_) | Error::Encoding(_) => {
                    warn!(name = %stanza.name, id = ?stanza.id(), error = %e, "Dropping malformed stanza");
                }
                other => {
                    warn!(name = %stanza.name, error = %other, "Stanza handler failed");
                }
            }
        }
    }

    fn route(&mut self, stanza: &Stanza, now: Instant) -> Result<()> {
        let cb = &self.callbacks;
        match stanza.kind() {
            // Already interpreted by the state machine.
            StanzaKind::Handshake | StanzaKind::Captcha | StanzaKind::TempBan => {}
            StanzaKind::Ack => trace!(id = ?stanza.id(), "ack"),
            StanzaKind::Pong => {
                let latency = self.last_ping.take().map(|sent| now.saturating_duration_since(sent));
                debug!(latency = ?latency, "pong");
                cb.on_pong(&Pong { latency });
            }
            StanzaKind::Message { message_type } => match message_type.as_deref() {
                Some("chat") => cb.on_chat_message(&IncomingMessage::from_stanza(stanza)?),
                Some("groupchat") => cb.on_group_message(&IncomingMessage::from_stanza(stanza)?),
                Some("receipt") => {
                    let receipt = Receipt::from_stanza(stanza)?;
                    match receipt.kind {
                        ReceiptKind::Delivered => cb.on_message_delivered(&receipt),
                        ReceiptKind::Read => cb.on_message_read(&receipt),
                    }
                }
                Some("is-typing") => {
                    let typing = TypingEvent::from_stanza(stanza)?;
                    if typing.group_jid.is_some() {
                        cb.on_group_typing(&typing);
                    } else {
                        cb.on_typing(&typing);
                    }
                }
                Some("error") => cb.on_message_error(&MessageError::from_stanza(stanza)?),
                _ => cb.on_unhandled_stanza(stanza),
            },
            StanzaKind::Iq { iq_type, namespace } => {
                let is_push = matches!(iq_type.as_deref(), Some("set") | Some("get"));
                if is_push && namespace.as_deref() == Some(ROSTER_NAMESPACE) {
                    cb.on_roster_push(&RosterPush::from_stanza(stanza)?);
                } else {
                    cb.on_unsolicited_iq(stanza);
                }
            }
            StanzaKind::Stc | StanzaKind::Unknown(_) => cb.on_unhandled_stanza(stanza),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::ResponseHandle;
    use crate::stanza::decode;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl SessionCallbacks for Recorder {
        fn on_chat_message(&self, message: &IncomingMessage) {
            self.push(format!("chat:{}", message.message_id));
        }
        fn on_group_message(&self, message: &IncomingMessage) {
            self.push(format!("group:{}", message.message_id));
        }
        fn on_message_delivered(&self, _: &Receipt) {
            self.push("delivered");
        }
        fn on_message_read(&self, _: &Receipt) {
            self.push("read");
        }
        fn on_typing(&self, _: &TypingEvent) {
            self.push("typing");
        }
        fn on_group_typing(&self, _: &TypingEvent) {
            self.push("group-typing");
        }
        fn on_message_error(&self, _: &MessageError) {
            self.push("message-error");
        }
        fn on_roster_push(&self, push: &RosterPush) {
            self.push(format!("roster:{}", push.items.len()));
        }
        fn on_pong(&self, pong: &Pong) {
            self.push(format!("pong:{}", pong.latency.is_some()));
        }
        fn on_iq_response(&self, stanza: &Stanza) {
            self.push(format!("response:{}", stanza.id().unwrap_or_default()));
        }
        fn on_unsolicited_iq(&self, _: &Stanza) {
            self.push("unsolicited-iq");
        }
        fn on_unhandled_stanza(&self, stanza: &Stanza) {
            self.push(format!("unhandled:{}", stanza.name));
        }
    }

    fn setup() -> (Arc<Recorder>, Dispatcher, Correlator) {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(recorder.clone());
        (recorder, dispatcher, Correlator::new())
    }

    fn feed(dispatcher: &mut Dispatcher, correlator: &mut Correlator, xml: &str) {
        dispatcher.dispatch(decode(xml.as_bytes()).unwrap(), correlator, Instant::now());
    }

    #[tokio::test]
    async fn test_pending_response_goes_to_requester() {
        let (recorder, mut dispatcher, mut correlator) = setup();
        let handle = correlator.register("q1", None).unwrap();

        feed(&mut dispatcher, &mut correlator, r#"<iq type="result" id="q1"/>"#);

        assert_eq!(recorder.take(), vec!["response:q1"]);
        assert_eq!(handle.wait().await.unwrap().id(), Some("q1"));
    }

    /// Checks, from inside the callback, whether the requester already has its response.
    #[derive(Default)]
    struct ResponseObserver {
        handle: Mutex<Option<ResponseHandle>>,
        completed_first: Mutex<Option<bool>>,
    }

    impl SessionCallbacks for ResponseObserver {
        fn on_iq_response(&self, _: &Stanza) {
            let mut handle = self.handle.lock().unwrap();
            let completed = handle.as_mut().map(|h| h.try_wait().is_some());
            *self.completed_first.lock().unwrap() = completed;
        }
    }

    #[test]
    fn test_requester_completed_before_response_callback() {
        let observer = Arc::new(ResponseObserver::default());
        let mut dispatcher = Dispatcher::new(observer.clone());
        let mut correlator = Correlator::new();
        let handle = correlator.register("q2", None).unwrap();
        *observer.handle.lock().unwrap() = Some(handle);

        feed(&mut dispatcher, &mut correlator, r#"<iq type="result" id="q2"/>"#);

        assert_eq!(*observer.completed_first.lock().unwrap(), Some(true));
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_message_routing() {
        let (recorder, mut dispatcher, mut correlator) = setup();
        let stanzas = [
            r#"<message type="chat" from="b@talk.kik.com" id="m1"><body>hi</body></message>"#,
            r#"<message type="groupchat" from="b@talk.kik.com" id="m2"><g jid="1_g@groups.kik.com"/></message>"#,
            r#"<message type="receipt" from="b@talk.kik.com"><receipt type="delivered"><msgid id="x"/></receipt></message>"#,
            r#"<message type="receipt" from="b@talk.kik.com"><receipt type="read"><msgid id="x"/></receipt></message>"#,
            r#"<message type="is-typing" from="b@talk.kik.com"><is-typing val="true"/></message>"#,
            r#"<message type="is-typing" from="b@talk.kik.com"><g jid="1_g@groups.kik.com"/><is-typing val="true"/></message>"#,
            r#"<message type="error" id="m9"><error><not-found/></error></message>"#,
            r#"<message type="status" from="b@talk.kik.com"/>"#,
        ];
        for xml in stanzas {
            feed(&mut dispatcher, &mut correlator, xml);
        }
        assert_eq!(
            recorder.take(),
            vec![
                "chat:m1",
                "group:m2",
                "delivered",
                "read",
                "typing",
                "group-typing",
                "message-error",
                "unhandled:message",
            ]
        );
    }

    #[test]
    fn test_malformed_stanza_is_dropped() {
        let (recorder, mut dispatcher, mut correlator) = setup();
        feed(&mut dispatcher, &mut correlator, r#"<message type="chat" id="m1"/>"#);
        feed(&mut dispatcher, &mut correlator, r#"<message type="chat" from="b@talk.kik.com" id="m2"/>"#);
        assert_eq!(recorder.take(), vec!["chat:m2"]);
    }

    #[test]
    fn test_iq_routing() {
        let (recorder, mut dispatcher, mut correlator) = setup();
        feed(
            &mut dispatcher,
            &mut correlator,
            r#"<iq type="set" id="r"><query xmlns="jabber:iq:roster"><item jid="a@talk.kik.com"/></query></iq>"#,
        );
        feed(&mut dispatcher, &mut correlator, r#"<iq type="result" id="late"/>"#);
        assert_eq!(recorder.take(), vec!["roster:1", "unsolicited-iq"]);
    }

    #[test]
    fn test_silent_kinds() {
        let (recorder, mut dispatcher, mut correlator) = setup();
        feed(&mut dispatcher, &mut correlator, "<ack id=\"a\"/>");
        feed(&mut dispatcher, &mut correlator, "<k ok=\"1\">");
        feed(&mut dispatcher, &mut correlator, "<stc id=\"s\"><stp type=\"ca\">u</stp></stc>");
        assert!(recorder.take().is_empty());

        feed(&mut dispatcher, &mut correlator, "<xiphias-frame/>");
        assert_eq!(recorder.take(), vec!["unhandled:xiphias-frame"]);
    }

    #[test]
    fn test_pong_latency_only_after_ping() {
        let (recorder, mut dispatcher, mut correlator) = setup();
        feed(&mut dispatcher, &mut correlator, "<pong/>");

        let sent = Instant::now();
        dispatcher.ping_sent(sent);
        dispatcher.dispatch(
            decode(b"<pong/>").unwrap(),
            &mut correlator,
            sent + Duration::from_millis(40),
        );
        assert_eq!(recorder.take(), vec!["pong:false", "pong:true"]);
    }
}
