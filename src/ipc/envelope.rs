//! RPC envelope: the single message shape exchanged between processes.
//!
//! A request names its target by two strings (component, method). A reply
//! either carries a payload or an application `error`, never both. Transport
//! failures never populate `error`; they surface as local errors on the caller.

use serde::{Deserialize, Serialize};

use crate::types::{CallContext, Error, ErrorMessage, Payload, Result, WirePayload};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub component: String,
    pub method: String,
    pub payload: Option<WirePayload>,
    pub context: CallContext,
    pub error: Option<ErrorMessage>,
}

impl Envelope {
    pub fn request(
        component: impl Into<String>,
        method: impl Into<String>,
        payload: WirePayload,
        context: CallContext,
    ) -> Self {
        Self {
            component: component.into(),
            method: method.into(),
            payload: Some(payload),
            context,
            error: None,
        }
    }

    /// Successful reply to `self`.
    pub fn reply(&self, payload: WirePayload, context: CallContext) -> Self {
        Self {
            component: self.component.clone(),
            method: self.method.clone(),
            payload: Some(payload),
            context,
            error: None,
        }
    }

    /// Error reply to `self`; the payload is left empty.
    pub fn reply_error(&self, error: &Error, context: CallContext) -> Self {
        Self {
            component: self.component.clone(),
            method: self.method.clone(),
            payload: None,
            context,
            error: Some(error.to_reply()),
        }
    }

    /// Error reply when the request could not even be decoded.
    pub fn undecodable(error: &Error) -> Self {
        Self {
            component: String::new(),
            method: String::new(),
            payload: None,
            context: CallContext::default(),
            error: Some(error.to_reply()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| Error::server(format!("cannot decode envelope: {}", e)))
    }

    /// Unpack a reply into its payload and returned context.
    pub fn into_result(self) -> Result<(Payload, CallContext)> {
        if let Some(error) = self.error {
            return Err(Error::from_reply(error));
        }
        match self.payload {
            Some(wire) => Ok((Payload::from_wire(wire), self.context)),
            None => Err(Error::server(format!(
                "reply from {}.{} carried neither payload nor error",
                self.component, self.method
            ))),
        }
    }
}
