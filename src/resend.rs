//! Unicast resend requests.
//!
//! The repair sweep hands over a pre-coalesced list of missing ranges; this
//! requester serialises them into a single OHM Resend datagram and sends it
//! to the sender endpoint of the active session. No merging, no retry: the
//! next sweep re-requests whatever is still missing.

use crate::ohm_header::{OhmHeader, OhmMsgType};
use crate::ohm_messages::OhmResendRanges;
use crate::ohm_socket::OhmSocket;
use crate::repairer::ResendRangeRequester;
use crate::seq::SeqRange;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub struct OhmResendRequester {
    socket: Arc<OhmSocket>,
    endpoint: Mutex<Option<SocketAddr>>,
}

impl OhmResendRequester {
    pub fn new(socket: Arc<OhmSocket>) -> OhmResendRequester {
        OhmResendRequester {
            socket,
            endpoint: Mutex::new(None),
        }
    }

    /// Point requests at the sender of the session being played. Requests
    /// made while no endpoint is set are dropped.
    pub fn set_endpoint(&self, endpoint: Option<SocketAddr>) {
        *self.endpoint.lock().unwrap() = endpoint;
    }
}

impl ResendRangeRequester for OhmResendRequester {
    fn request_resend(&self, ranges: &[SeqRange]) {
        let Some(endpoint) = *self.endpoint.lock().unwrap() else {
            debug!("no active sender endpoint - dropping resend request");
            return;
        };

        let message = OhmResendRanges { ranges: ranges.to_vec() };
        let mut buf = BytesMut::with_capacity(OhmHeader::SERIALIZED_LEN + message.serialized_len());
        // serialize the payload first: the varint count makes the length
        // cheaper to measure than to predict
        let mut payload = BytesMut::with_capacity(message.serialized_len());
        message.ser(&mut payload);
        OhmHeader::for_payload(OhmMsgType::Resend, payload.len()).ser(&mut buf);
        buf.extend_from_slice(&payload);

        if let Err(e) = self.socket.try_send(&buf, endpoint) {
            warn!("failed to send resend request to {:?}: {}", endpoint, e);
        }
    }
}
