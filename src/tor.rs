//! # Onion-Routed Messaging
//!
//! Each relay peels exactly one layer: it opens the blob sealed to its own
//! key and finds either the final message or the next envelope to forward.
//! The outer envelope is discarded at every hop, so a relay only ever learns
//! who sent it the layer and who to hand the next one to.
//!
//! ```text
//! origin ──► R1 ──► R2 ──► R3
//!   [R1 [R2 [R3 "msg"]]]
//! ```
//!
//! Any failure to open or parse a layer is a [`Fault::Security`]; the packet
//! is dropped and nothing is forwarded.

use rand::{CryptoRng, RngCore};
use rsa::RsaPublicKey;
use tracing::{debug, warn};

use crate::crypto::{LayerContents, OnionError, open_layer, seal_layer};
use crate::envelope::{Envelope, Payload, Route, TorPayload};
use crate::identity::Contact;
use crate::outcome::{Fault, Notification, Outcome};
use crate::state::NodeState;

pub fn handle(state: &NodeState, route: Route, payload: TorPayload) -> Outcome {
    if !route.is_addressed_to(state.name()) {
        return Outcome::forward(Envelope::new(route, Payload::Tor(payload)));
    }

    match peel(state, &payload) {
        Ok(LayerContents::Final { message }) => {
            debug!(from = %route.source, "onion reached its destination");
            Outcome::terminal().with(Notification::OnionDelivered { message })
        }
        Ok(LayerContents::Relay { next }) => {
            debug!(from = %route.source, to = %next.route.destination, "relaying onion layer");
            Outcome::forward(*next)
        }
        Err(e) => {
            warn!(from = %route.source, error = %e, "dropping onion");
            Outcome::fault(Fault::Security(e.to_string()))
        }
    }
}

fn peel(state: &NodeState, payload: &TorPayload) -> Result<LayerContents, OnionError> {
    let keypair = state.keypair().ok_or(OnionError::NoKeypair)?;
    let encryption = payload
        .encryption
        .as_ref()
        .ok_or(OnionError::MissingKeyMaterial)?;
    open_layer(keypair, &payload.blob, encryption, state.max_envelope_size())
}

/// Wrap `message` for delivery along `relays`, innermost layer first. The
/// last relay is the final recipient. Returns the outer envelope, addressed
/// from `origin` to the first relay.
pub fn build_onion<R: RngCore + CryptoRng>(
    rng: &mut R,
    origin: &Contact,
    relays: &[(Contact, RsaPublicKey)],
    message: impl Into<String>,
    time_sent: f64,
) -> Result<Envelope, OnionError> {
    if relays.is_empty() {
        return Err(OnionError::Seal("onion route has no relays".into()));
    }

    let mut contents = LayerContents::Final {
        message: message.into(),
    };
    let mut outer = None;

    for (i, (relay, public_key)) in relays.iter().enumerate().rev() {
        let (blob, encryption) = seal_layer(rng, public_key, &contents)?;
        let from = if i == 0 { origin } else { &relays[i - 1].0 };
        let envelope = Envelope::new(
            Route::new(from.clone(), relay.clone(), time_sent),
            Payload::Tor(TorPayload {
                blob,
                encryption: Some(encryption),
            }),
        );
        contents = LayerContents::Relay {
            next: Box::new(envelope.clone()),
        };
        outer = Some(envelope);
    }

    outer.ok_or_else(|| OnionError::Seal("onion route has no relays".into()))
}
